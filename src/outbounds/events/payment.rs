//! Payment lifecycle events published to other services.
//!
//! Every event carries the order id, the amount, a status and an RFC 3339 timestamp.
//! Confirmations add the transaction id, refunds the refund id and failures a reason.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::topology::{
    ORDER_EXCHANGE, ORDER_PAID, PAYMENT_CONFIRMED, PAYMENT_EXCHANGE, PAYMENT_FAILED,
    PAYMENT_PROCESSING, PAYMENT_REFUND_PROCESSED,
};

/// +----------------------------------------------------------+
/// | STRUCTS | TRAITS | ENUMS | FUNCTIONS                     |
/// +----------+-------+-------+------------------------------+
/// | Enums:                                                   |
/// |   - PaymentStatus                                        |
/// | Structs:                                                 |
/// |   - PaymentEvent                                         |
/// +----------------------------------------------------------+

/// Status carried by a [`PaymentEvent`]
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// The charge has started
    Processing,

    /// The charge succeeded
    Confirmed,

    /// The charge was refused
    Failed,

    /// The refund has started
    RefundProcessing,

    /// The refund succeeded
    Refunded,

    /// The refund was refused
    RefundFailed,

    /// Notification to the order service
    Paid,
}

impl PaymentStatus {
    /// Exchange and routing key the event is published with.
    pub fn route(&self) -> (&'static str, &'static str) {
        match self {
            Self::Processing => (PAYMENT_EXCHANGE, PAYMENT_PROCESSING),
            Self::Confirmed => (PAYMENT_EXCHANGE, PAYMENT_CONFIRMED),
            Self::Failed => (PAYMENT_EXCHANGE, PAYMENT_FAILED),
            Self::RefundProcessing | Self::Refunded | Self::RefundFailed => {
                (PAYMENT_EXCHANGE, PAYMENT_REFUND_PROCESSED)
            }
            Self::Paid => (ORDER_EXCHANGE, ORDER_PAID),
        }
    }

    /// Whether losing the event is acceptable.
    pub fn is_notification(&self) -> bool {
        matches!(self, Self::Paid)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    pub order_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PaymentEvent {
    fn new(order_id: &str, amount: Decimal, status: PaymentStatus) -> Self {
        Self {
            order_id: order_id.to_string(),
            amount,
            status,
            timestamp: Utc::now(),
            transaction_id: None,
            refund_id: None,
            reason: None,
        }
    }

    pub fn processing(order_id: &str, amount: Decimal) -> Self {
        Self::new(order_id, amount, PaymentStatus::Processing)
    }

    pub fn confirmed(order_id: &str, amount: Decimal, transaction_id: &str) -> Self {
        Self {
            transaction_id: Some(transaction_id.to_string()),
            ..Self::new(order_id, amount, PaymentStatus::Confirmed)
        }
    }

    pub fn failed(order_id: &str, amount: Decimal, reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::new(order_id, amount, PaymentStatus::Failed)
        }
    }

    pub fn order_paid(order_id: &str, amount: Decimal, transaction_id: &str) -> Self {
        Self {
            transaction_id: Some(transaction_id.to_string()),
            ..Self::new(order_id, amount, PaymentStatus::Paid)
        }
    }

    pub fn refund_processing(order_id: &str, amount: Decimal) -> Self {
        Self::new(order_id, amount, PaymentStatus::RefundProcessing)
    }

    pub fn refunded(order_id: &str, amount: Decimal, refund_id: &str) -> Self {
        Self {
            refund_id: Some(refund_id.to_string()),
            ..Self::new(order_id, amount, PaymentStatus::Refunded)
        }
    }

    pub fn refund_failed(order_id: &str, amount: Decimal, reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::new(order_id, amount, PaymentStatus::RefundFailed)
        }
    }
}
