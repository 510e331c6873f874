use std::sync::Arc;

use async_trait::async_trait;
use rabbitmq::{HandlerError, InboundMessage, MessageHandler};
use tracing::{info, warn};

use crate::{
    domain::{models::requests::RefundRequest, services::payment_gateway::PaymentGateway},
    outbounds::{event_sink::EventSink, events::payment::PaymentEvent},
};

/// Refunds an order: `refund_processing`, then `refunded` with the refund id or
/// `refund_failed` with the reason. Same error handling as the payment request handler.
pub struct RefundRequestHandler {
    gateway: Arc<dyn PaymentGateway>,
    sink: Arc<dyn EventSink>,
}

impl RefundRequestHandler {
    pub fn new(gateway: Arc<dyn PaymentGateway>, sink: Arc<dyn EventSink>) -> Self {
        Self { gateway, sink }
    }

    pub async fn process(&self, request: &RefundRequest) -> Result<(), HandlerError> {
        let order_id = request.order_id.as_str();
        let amount = request.amount;
        info!("Processing refund of {} for order {}", amount, order_id);

        self.sink
            .emit(PaymentEvent::refund_processing(order_id, amount))
            .await?;

        let outcome = match self.gateway.refund(order_id, amount).await {
            Ok(refund) => PaymentEvent::refunded(order_id, amount, &refund.refund_id),
            Err(err) => {
                warn!("Refund for order {} failed: {}", order_id, err);
                PaymentEvent::refund_failed(order_id, amount, &err.to_string())
            }
        };
        self.sink.emit(outcome).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for RefundRequestHandler {
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError> {
        let request: RefundRequest = serde_json::from_value(message.payload)
            .map_err(|e| HandlerError::Decode(format!("Invalid refund request: {}", e)))?;
        self.process(&request).await
    }
}
