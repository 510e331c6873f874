/// +----------------------------------------------------------+
/// | MODULES                                                  |
/// +----------+-------+-------+------------------------------+
/// | Exports:                                                 |
/// |   - event_sink                                           |
/// |   - events                                               |
/// +----------------------------------------------------------+

/// Publishes payment events and requests to the broker.
pub mod event_sink;

/// Payment lifecycle events emitted by this service.
pub mod events;
