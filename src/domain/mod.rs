/// +----------------------------------------------------------+
/// | MODULES                                                  |
/// +----------+-------+-------+------------------------------+
/// | Exports:                                                 |
/// |   - models                                               |
/// |   - services                                             |
/// +----------------------------------------------------------+

/// Payment records and the request messages that drive them.
pub mod models;

/// Payment gateway and payment store capabilities.
pub mod services;
