use std::sync::Arc;

use async_trait::async_trait;
use rabbitmq::{HandlerError, InboundMessage, MessageHandler};
use tracing::{debug, info, warn};

use crate::{
    domain::{models::requests::PaymentRequest, services::payment_gateway::PaymentGateway},
    outbounds::{event_sink::EventSink, events::payment::PaymentEvent},
};

/// +----------------------------------------------------------+
/// | STRUCTS | TRAITS | ENUMS | FUNCTIONS                     |
/// +----------+-------+-------+------------------------------+
/// | Structs:                                                 |
/// |   - PaymentRequestHandler                                |
/// | Implementations:                                         |
/// |   - MessageHandler for PaymentRequestHandler             |
/// +----------------------------------------------------------+

/// Charges the order named by a payment request and reports the outcome.
///
/// # Flow
///
/// 1. Emits a `processing` event
/// 2. Charges the order through the payment gateway
/// 3. On success emits `confirmed` with the transaction id, then notifies the order service
/// 4. On a gateway refusal emits `failed` with the reason
///
/// # Error Handling
///
/// * Gateway refusals become `failed` events and the message is acked
/// * Publish failures propagate so the message is requeued
/// * Malformed payloads are reported as `HandlerError::Decode`
pub struct PaymentRequestHandler {
    gateway: Arc<dyn PaymentGateway>,
    sink: Arc<dyn EventSink>,
}

impl PaymentRequestHandler {
    pub fn new(gateway: Arc<dyn PaymentGateway>, sink: Arc<dyn EventSink>) -> Self {
        Self { gateway, sink }
    }

    pub async fn process(&self, request: &PaymentRequest) -> Result<(), HandlerError> {
        let order_id = request.order_id.as_str();
        let amount = request.amount;
        info!("Processing payment of {} for order {}", amount, order_id);

        self.sink
            .emit(PaymentEvent::processing(order_id, amount))
            .await?;

        match self.gateway.charge(order_id, amount).await {
            Ok(charge) => {
                info!(
                    "Payment for order {} confirmed: {}",
                    order_id, charge.transaction_id
                );
                self.sink
                    .emit(PaymentEvent::confirmed(order_id, amount, &charge.transaction_id))
                    .await?;
                self.sink
                    .emit(PaymentEvent::order_paid(order_id, amount, &charge.transaction_id))
                    .await?;
            }
            Err(err) => {
                warn!("Payment for order {} failed: {}", order_id, err);
                self.sink
                    .emit(PaymentEvent::failed(order_id, amount, &err.to_string()))
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for PaymentRequestHandler {
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError> {
        if message.redelivered {
            debug!("payment request redelivered from {}", message.queue);
        }
        let request: PaymentRequest = serde_json::from_value(message.payload)
            .map_err(|e| HandlerError::Decode(format!("Invalid payment request: {}", e)))?;
        self.process(&request).await
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;
    use crate::{
        domain::services::payment_gateway::{
            Charge, GatewayError, MockPaymentGateway, SimulatedGateway,
        },
        outbounds::{event_sink::testing::RecordingSink, events::payment::PaymentStatus},
    };

    fn message(payload: serde_json::Value) -> InboundMessage {
        InboundMessage {
            queue: "payment.request".to_string(),
            payload,
            redelivered: false,
        }
    }

    #[tokio::test]
    async fn should_emit_processing_confirmed_and_order_paid_on_success() {
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_charge().times(1).returning(|_, _| {
            Ok(Charge {
                transaction_id: "txn_42".to_string(),
            })
        });
        let sink = Arc::new(RecordingSink::default());
        let handler = PaymentRequestHandler::new(Arc::new(gateway), sink.clone());

        handler
            .handle(message(json!({ "orderId": "order-1", "amount": 25.5 })))
            .await
            .unwrap();

        assert_eq!(
            sink.statuses(),
            vec![
                PaymentStatus::Processing,
                PaymentStatus::Confirmed,
                PaymentStatus::Paid
            ]
        );
        let events = sink.events.lock();
        assert!(events.iter().all(|e| e.order_id == "order-1" && e.amount == dec!(25.5)));
        assert_eq!(events[1].transaction_id.as_deref(), Some("txn_42"));
        assert_eq!(events[2].transaction_id.as_deref(), Some("txn_42"));
    }

    #[tokio::test]
    async fn should_emit_failed_with_reason_when_declined() {
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_charge()
            .times(1)
            .returning(|_, _| Err(GatewayError::Declined("insufficient funds".to_string())));
        let sink = Arc::new(RecordingSink::default());
        let handler = PaymentRequestHandler::new(Arc::new(gateway), sink.clone());

        handler
            .handle(message(json!({ "orderId": "order-1", "amount": 10 })))
            .await
            .unwrap();

        assert_eq!(
            sink.statuses(),
            vec![PaymentStatus::Processing, PaymentStatus::Failed]
        );
        let events = sink.events.lock();
        assert_eq!(
            events[1].reason.as_deref(),
            Some("Payment declined: insufficient funds")
        );
        assert_eq!(events[1].transaction_id, None);
    }

    #[tokio::test]
    async fn should_propagate_publish_failures() {
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_charge().returning(|_, _| {
            Ok(Charge {
                transaction_id: "txn_1".to_string(),
            })
        });
        let sink = Arc::new(RecordingSink::default());
        *sink.fail_on.lock() = Some(PaymentStatus::Confirmed);
        let handler = PaymentRequestHandler::new(Arc::new(gateway), sink.clone());

        let err = handler
            .handle(message(json!({ "orderId": "order-1", "amount": 10 })))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Publish(_)));
        assert_eq!(sink.statuses(), vec![PaymentStatus::Processing]);
    }

    #[tokio::test]
    async fn should_reject_malformed_requests_without_charging() {
        // no expectations: any gateway call panics
        let gateway = MockPaymentGateway::new();
        let sink = Arc::new(RecordingSink::default());
        let handler = PaymentRequestHandler::new(Arc::new(gateway), sink.clone());

        let err = handler
            .handle(message(json!({ "amount": 10 })))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Decode(_)));
        assert!(sink.statuses().is_empty());
    }

    #[tokio::test]
    async fn should_replay_the_same_events_for_a_redelivered_request() {
        let sink = Arc::new(RecordingSink::default());
        let handler =
            PaymentRequestHandler::new(Arc::new(SimulatedGateway::new(dec!(100))), sink.clone());
        let payload = json!({ "orderId": "order-7", "amount": 30 });

        handler.handle(message(payload.clone())).await.unwrap();
        let mut replay = message(payload);
        replay.redelivered = true;
        handler.handle(replay).await.unwrap();

        let events = sink.events.lock();
        let statuses: Vec<PaymentStatus> = events.iter().map(|e| e.status).collect();
        assert_eq!(statuses[..3], statuses[3..]);
        assert_eq!(events[1].transaction_id, events[4].transaction_id);
        assert!(events[1].transaction_id.is_some());
    }
}
