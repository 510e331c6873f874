use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

pub mod simulated_gateway;

pub use simulated_gateway::SimulatedGateway;

/// A successful charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    pub transaction_id: String,
}

/// A successful refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refund {
    pub refund_id: String,
}

/// Capability that moves money for an order.
///
/// Requests are delivered at least once, so implementations must be idempotent per order id:
/// repeating a successful `charge` or `refund` for the same order returns the original
/// identifier without moving money again.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charges `amount` for `order_id`.
    ///
    /// # Returns
    /// * `Ok(Charge)` - The order is paid; the transaction id is stable across replays
    /// * `Err(GatewayError)` - The charge was refused
    async fn charge(&self, order_id: &str, amount: Decimal) -> Result<Charge, GatewayError>;

    /// Refunds `amount` of the charge made for `order_id`.
    ///
    /// # Returns
    /// * `Ok(Refund)` - The refund went through; the refund id is stable across replays
    /// * `Err(GatewayError)` - The refund was refused
    async fn refund(&self, order_id: &str, amount: Decimal) -> Result<Refund, GatewayError>;
}

/// Business-level refusals reported by a payment gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The charge was declined.
    #[error("Payment declined: {0}")]
    Declined(String),

    /// Refund requested for an order that was never charged.
    #[error("No charge found for order {0}")]
    UnknownOrder(String),

    /// Refund larger than the original charge.
    #[error("Refund of {requested} exceeds the charged amount of {charged}")]
    RefundExceedsCharge { requested: Decimal, charged: Decimal },

    /// The gateway could not be reached.
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),
}

//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module contains the payment gateway capability used by the payment request handlers.
//--------------------------------------------------------------------------------------------------

/// +----------------------------------------------------------+
/// | MODULES                                                  |
/// +----------+-------+-------+------------------------------+
/// | Exports:                                                 |
/// |   - PaymentGateway (trait)                               |
/// |   - SimulatedGateway (struct)                            |
/// |   - GatewayError (enum)                                  |
/// |   - MockPaymentGateway (for tests)                       |
/// +----------------------------------------------------------+

#[cfg(test)]
use mockall::*;

#[cfg(test)]
mock! {
    pub PaymentGateway {}

    #[async_trait]
    impl PaymentGateway for PaymentGateway {
        async fn charge(&self, order_id: &str, amount: Decimal) -> Result<Charge, GatewayError>;

        async fn refund(&self, order_id: &str, amount: Decimal) -> Result<Refund, GatewayError>;
    }
}
