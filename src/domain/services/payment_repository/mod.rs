use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::payment::{NewPayment, Payment, PaymentUpdate, ValidationError};

pub mod in_memory_repository;

pub use in_memory_repository::InMemoryPaymentRepository;

/// Store of payment records keyed by id, with `userId` unique across records.
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn create(&self, new: NewPayment) -> Result<Payment, RepositoryError>;

    /// All payments in creation order.
    async fn list(&self) -> Result<Vec<Payment>, RepositoryError>;

    async fn get(&self, id: Uuid) -> Result<Payment, RepositoryError>;

    /// Applies a partial update and returns the updated record.
    async fn update(&self, id: Uuid, update: PaymentUpdate) -> Result<Payment, RepositoryError>;
}

/// Errors that can occur during payment store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Payment not found: {0}")]
    NotFound(Uuid),

    #[error("A payment for user {0} already exists")]
    DuplicateUser(String),

    #[error("Invalid payment: {0}")]
    Invalid(#[from] ValidationError),
}
