use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Charge, GatewayError, PaymentGateway, Refund};

struct ChargeRecord {
    charge: Charge,
    amount: Decimal,
}

/// In-process gateway that approves charges up to a limit.
///
/// Successful charges and refunds are remembered by order id, so a replayed request returns
/// the same identifiers instead of charging twice.
pub struct SimulatedGateway {
    limit: Decimal,
    charges: Mutex<HashMap<String, ChargeRecord>>,
    refunds: Mutex<HashMap<String, Refund>>,
}

impl SimulatedGateway {
    pub fn new(limit: Decimal) -> Self {
        Self {
            limit,
            charges: Mutex::new(HashMap::new()),
            refunds: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn charge(&self, order_id: &str, amount: Decimal) -> Result<Charge, GatewayError> {
        let mut charges = self.charges.lock();
        if let Some(existing) = charges.get(order_id) {
            debug!("order {} already charged, replaying {}", order_id, existing.charge.transaction_id);
            return Ok(existing.charge.clone());
        }

        if amount <= Decimal::ZERO {
            return Err(GatewayError::Declined("amount must be positive".to_string()));
        }
        if amount > self.limit {
            return Err(GatewayError::Declined(format!(
                "amount {} exceeds the limit of {}",
                amount, self.limit
            )));
        }

        let charge = Charge {
            transaction_id: format!("txn_{}", Uuid::new_v4().simple()),
        };
        info!("charged {} for order {}", amount, order_id);
        charges.insert(
            order_id.to_string(),
            ChargeRecord {
                charge: charge.clone(),
                amount,
            },
        );
        Ok(charge)
    }

    async fn refund(&self, order_id: &str, amount: Decimal) -> Result<Refund, GatewayError> {
        let mut refunds = self.refunds.lock();
        if let Some(existing) = refunds.get(order_id) {
            debug!("order {} already refunded, replaying {}", order_id, existing.refund_id);
            return Ok(existing.clone());
        }

        let charged = self
            .charges
            .lock()
            .get(order_id)
            .map(|record| record.amount)
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.to_string()))?;
        if amount > charged {
            return Err(GatewayError::RefundExceedsCharge {
                requested: amount,
                charged,
            });
        }

        let refund = Refund {
            refund_id: format!("rfd_{}", Uuid::new_v4().simple()),
        };
        info!("refunded {} for order {}", amount, order_id);
        refunds.insert(order_id.to_string(), refund.clone());
        Ok(refund)
    }
}
