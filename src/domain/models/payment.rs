use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// +----------------------------------------------------------+
/// | STRUCTS | TRAITS | ENUMS | FUNCTIONS                     |
/// +----------+-------+-------+------------------------------+
/// | Structs:                                                 |
/// |   - Payment                                              |
/// |   - NewPayment                                           |
/// |   - PaymentUpdate                                        |
/// | Enums:                                                   |
/// |   - ValidationError                                      |
/// +----------------------------------------------------------+

/// Reasons a payment record is refused before it reaches the store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("amount must be greater than zero")]
    NonPositiveAmount,
}

/// A payment as stored and returned by the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: Uuid,
    /// Unique across all payments
    pub user_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub order_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Creates a record with a fresh id; both timestamps are `now`.
    pub fn create(new: NewPayment, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        new.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            amount: new.amount,
            order_id: new.order_id,
            created_at: now,
            updated_at: now,
        })
    }

    /// Applies the fields present in `update`, validating the result.
    pub fn apply(&mut self, update: PaymentUpdate, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let candidate = NewPayment {
            user_id: update.user_id.unwrap_or_else(|| self.user_id.clone()),
            amount: update.amount.unwrap_or(self.amount),
            order_id: update.order_id.unwrap_or_else(|| self.order_id.clone()),
        };
        candidate.validate()?;

        self.user_id = candidate.user_id;
        self.amount = candidate.amount;
        self.order_id = candidate.order_id;
        self.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPayment {
    pub user_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub order_id: String,
}

impl NewPayment {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::Missing("userId"));
        }
        if self.order_id.trim().is_empty() {
            return Err(ValidationError::Missing("orderId"));
        }
        if self.amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount);
        }
        Ok(())
    }
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentUpdate {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub order_id: Option<String>,
}
