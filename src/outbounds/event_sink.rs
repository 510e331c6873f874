//! Maps typed payment messages onto broker publishers.

use async_trait::async_trait;
use rabbitmq::{ConnectionManager, FailurePolicy, Publisher, RabbitMQError};
use tracing::info;

use super::events::payment::PaymentEvent;
use crate::{
    domain::models::requests::{PaymentRequest, RefundRequest},
    topology::{PAYMENT_EXCHANGE, PAYMENT_REFUND, PAYMENT_REQUEST},
};

/// Outbound side of the payment service.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publishes a lifecycle event on the route of its status.
    async fn emit(&self, event: PaymentEvent) -> Result<(), RabbitMQError>;

    /// Asks the payment workers to charge an order.
    async fn request_payment(&self, request: &PaymentRequest) -> Result<(), RabbitMQError>;

    /// Asks the payment workers to refund an order.
    async fn request_refund(&self, request: &RefundRequest) -> Result<(), RabbitMQError>;
}

/// [`EventSink`] backed by the shared broker connection.
///
/// Lifecycle events and requests must not be lost and propagate failures. Order notifications
/// go to an exchange this service does not bind, so their failures are logged and dropped.
#[derive(Debug, Clone)]
pub struct RabbitEventSink {
    events: Publisher,
    notifications: Publisher,
}

impl RabbitEventSink {
    pub fn new(manager: ConnectionManager, app_id: &str) -> Self {
        Self {
            events: Publisher::new(manager.clone(), app_id),
            notifications: Publisher::new(manager, app_id)
                .with_failure_policy(FailurePolicy::LogAndSwallow),
        }
    }
}

#[async_trait]
impl EventSink for RabbitEventSink {
    async fn emit(&self, event: PaymentEvent) -> Result<(), RabbitMQError> {
        let (exchange, routing_key) = event.status.route();
        let publisher = if event.status.is_notification() {
            &self.notifications
        } else {
            &self.events
        };
        info!(
            "Sending {:?} event for order {} to {}",
            event.status, event.order_id, routing_key
        );
        publisher.publish(exchange, routing_key, &event).await
    }

    async fn request_payment(&self, request: &PaymentRequest) -> Result<(), RabbitMQError> {
        self.events
            .publish(PAYMENT_EXCHANGE, PAYMENT_REQUEST, request)
            .await
    }

    async fn request_refund(&self, request: &RefundRequest) -> Result<(), RabbitMQError> {
        self.events
            .publish(PAYMENT_EXCHANGE, PAYMENT_REFUND, request)
            .await
    }
}
