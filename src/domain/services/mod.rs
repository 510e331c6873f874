/// +----------------------------------------------------------+
/// | MODULES                                                  |
/// +----------+-------+-------+------------------------------+
/// | Exports:                                                 |
/// |   - payment_gateway                                      |
/// |   - payment_repository                                   |
/// +----------------------------------------------------------+

/// Charging and refunding orders.
pub mod payment_gateway;

/// Storage of payment records.
pub mod payment_repository;
