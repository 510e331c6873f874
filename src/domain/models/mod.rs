/// +----------------------------------------------------------+
/// | MODULES                                                  |
/// +----------+-------+-------+------------------------------+
/// | Exports:                                                 |
/// |   - payment                                              |
/// |   - requests                                             |
/// +----------------------------------------------------------+

/// The stored payment record.
pub mod payment;

/// Inbound request messages consumed from the broker.
pub mod requests;
