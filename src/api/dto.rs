//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name                 | Description                               | Key Methods         |
// |----------------------|-------------------------------------------|---------------------|
// | RefundBody           | Optional body of a refund call            | into_request        |
// | BrokerStatusResponse | Broker connection report                  | new                 |
//--------------------------------------------------------------------------------------------------

use rabbitmq::ConnectionStatus;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::models::{payment::Payment, requests::RefundRequest};

/// Body of `POST /api/payments/:id/refund`; the whole payment is refunded when `amount` is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundBody {
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl RefundBody {
    pub fn into_request(self, payment: &Payment) -> RefundRequest {
        RefundRequest {
            order_id: payment.order_id.clone(),
            amount: self.amount.unwrap_or(payment.amount),
            reason: self.reason,
        }
    }
}

/// Connection report returned by the broker test route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatusResponse {
    pub is_connected: bool,
    pub is_connecting: bool,
    pub reconnect_attempts: u32,
    pub queues: Vec<String>,
}

impl BrokerStatusResponse {
    pub fn new(status: ConnectionStatus, queues: Vec<&str>) -> Self {
        Self {
            is_connected: status.is_connected(),
            is_connecting: status.is_connecting(),
            reconnect_attempts: status.reconnect_attempts,
            queues: queues.into_iter().map(String::from).collect(),
        }
    }
}
