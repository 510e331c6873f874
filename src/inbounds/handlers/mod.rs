/// +----------------------------------------------------------+
/// | MODULES                                                  |
/// +----------+-------+-------+------------------------------+
/// | Exports:                                                 |
/// |   - payment_request_handler                              |
/// |   - refund_request_handler                               |
/// +----------------------------------------------------------+

/// Handler for `payment.request` messages
pub mod payment_request_handler;

/// Handler for `payment.refund` messages
pub mod refund_request_handler;

pub use payment_request_handler::PaymentRequestHandler;
pub use refund_request_handler::RefundRequestHandler;
