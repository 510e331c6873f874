/// +----------------------------------------------------------+
/// | MODULES                                                  |
/// +----------+-------+-------+------------------------------+
/// | Exports:                                                 |
/// |   - handlers                                             |
/// +----------------------------------------------------------+

/// Handlers for messages consumed from the payment queues.
pub mod handlers;
