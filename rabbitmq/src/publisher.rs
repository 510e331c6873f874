use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    ConnectionManager, RabbitMQError,
    transport::{MessageProperties, OutboundMessage, PublishOutcome},
};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// What a [`Publisher`] does when a message cannot be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Return the error to the caller
    #[default]
    Propagate,
    /// Log the error and report success; for fire-and-forget notifications
    LogAndSwallow,
}

/// A message to be published, addressed by exchange and routing key.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub exchange: String,
    pub routing_key: String,
    pub payload: serde_json::Value,
    pub persistent: bool,
    pub content_type: String,
}

impl OutboundEvent {
    /// Builds a persistent JSON event from any serializable payload.
    pub fn new<T: Serialize>(
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<Self, RabbitMQError> {
        let payload = serde_json::to_value(payload)
            .map_err(|err| RabbitMQError::Serialization(err.to_string()))?;
        Ok(Self {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload,
            persistent: true,
            content_type: JSON_CONTENT_TYPE.to_owned(),
        })
    }
}

/// Publishes JSON events through the shared connection.
///
/// ## Delivery
///
/// Every message is sent with the `mandatory` flag and waits for the broker's publisher
/// confirm before `publish` returns:
///
/// | Broker verdict | Result            |
/// |----------------|-------------------|
/// | ack            | `Ok(())`          |
/// | return + ack   | `PublishRejected` |
/// | nack           | `PublishFailed`   |
/// | transport error| `PublishFailed`   |
///
/// A Publisher keeps no state between calls. Clones are cheap and share the connection.
#[derive(Debug, Clone)]
pub struct Publisher {
    manager: ConnectionManager,
    app_id: String,
    policy: FailurePolicy,
}

impl Publisher {
    pub fn new(manager: ConnectionManager, app_id: &str) -> Self {
        Self {
            manager,
            app_id: app_id.to_owned(),
            policy: FailurePolicy::Propagate,
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Serializes `payload` as JSON and publishes it to `exchange` with `routing_key`.
    pub async fn publish<T: Serialize + Sync>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), RabbitMQError> {
        let event = match OutboundEvent::new(exchange, routing_key, payload) {
            Ok(event) => event,
            Err(err) => return self.apply_policy(err),
        };
        self.send(event).await
    }

    pub async fn send(&self, event: OutboundEvent) -> Result<(), RabbitMQError> {
        match self.deliver(&event).await {
            Ok(()) => {
                debug!(
                    "published to {} with routing key {}",
                    event.exchange, event.routing_key
                );
                Ok(())
            }
            Err(err) => self.apply_policy(err),
        }
    }

    async fn deliver(&self, event: &OutboundEvent) -> Result<(), RabbitMQError> {
        let body = serde_json::to_vec(&event.payload)
            .map_err(|err| RabbitMQError::Serialization(err.to_string()))?;

        let channel = self
            .manager
            .channel()
            .await
            .map_err(|err| RabbitMQError::PublishFailed(err.to_string()))?;

        let message = OutboundMessage {
            exchange: event.exchange.clone(),
            routing_key: event.routing_key.clone(),
            body,
            properties: MessageProperties {
                content_type: event.content_type.clone(),
                persistent: event.persistent,
                app_id: self.app_id.clone(),
                message_id: Uuid::new_v4().to_string(),
                timestamp: unix_timestamp(),
            },
            mandatory: true,
        };

        match channel.publish(message).await {
            Ok(PublishOutcome::Confirmed) => Ok(()),
            Ok(PublishOutcome::Returned) => Err(RabbitMQError::PublishRejected {
                exchange: event.exchange.clone(),
                routing_key: event.routing_key.clone(),
            }),
            Ok(PublishOutcome::Nacked) => Err(RabbitMQError::PublishFailed(
                "broker nacked the message".to_owned(),
            )),
            Err(err) => {
                self.manager.report_channel_failure(&channel);
                Err(match err {
                    RabbitMQError::PublishFailed(_) => err,
                    other => RabbitMQError::PublishFailed(other.to_string()),
                })
            }
        }
    }

    fn apply_policy(&self, err: RabbitMQError) -> Result<(), RabbitMQError> {
        match self.policy {
            FailurePolicy::Propagate => {
                error!("publish failed: {}", err);
                Err(err)
            }
            FailurePolicy::LogAndSwallow => {
                warn!("publish failed, dropping message: {}", err);
                Ok(())
            }
        }
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
