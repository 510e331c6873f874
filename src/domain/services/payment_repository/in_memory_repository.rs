use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{PaymentRepository, RepositoryError};
use crate::domain::models::payment::{NewPayment, Payment, PaymentUpdate};

/// Process-local payment store.
#[derive(Default)]
pub struct InMemoryPaymentRepository {
    payments: RwLock<Vec<Payment>>,
}

impl InMemoryPaymentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentRepository for InMemoryPaymentRepository {
    async fn create(&self, new: NewPayment) -> Result<Payment, RepositoryError> {
        let payment = Payment::create(new, Utc::now())?;

        let mut payments = self.payments.write();
        if payments.iter().any(|p| p.user_id == payment.user_id) {
            return Err(RepositoryError::DuplicateUser(payment.user_id));
        }
        payments.push(payment.clone());
        debug!("stored payment {}", payment.id);
        Ok(payment)
    }

    async fn list(&self) -> Result<Vec<Payment>, RepositoryError> {
        Ok(self.payments.read().clone())
    }

    async fn get(&self, id: Uuid) -> Result<Payment, RepositoryError> {
        self.payments
            .read()
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or(RepositoryError::NotFound(id))
    }

    async fn update(&self, id: Uuid, update: PaymentUpdate) -> Result<Payment, RepositoryError> {
        let mut payments = self.payments.write();

        if let Some(user_id) = &update.user_id {
            if payments.iter().any(|p| p.id != id && &p.user_id == user_id) {
                return Err(RepositoryError::DuplicateUser(user_id.clone()));
            }
        }

        let payment = payments
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(RepositoryError::NotFound(id))?;
        payment.apply(update, Utc::now())?;
        Ok(payment.clone())
    }
}
