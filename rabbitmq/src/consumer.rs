use std::sync::Arc;

use async_trait::async_trait;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    ConnectionManager, HandlerError, RabbitMQError,
    transport::{BrokerChannel, Delivery},
};

/// A decoded delivery handed to a [`MessageHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub queue: String,
    pub payload: serde_json::Value,
    /// The broker delivered this message before without an ack
    pub redelivered: bool,
}

/// Reaction to messages of one queue.
///
/// `Ok` acks the delivery. Any error nacks it with requeue, so the broker redelivers it later;
/// handlers must therefore tolerate seeing the same message more than once.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError>;
}

/// Delivery tag bound to the channel the message arrived on.
///
/// Settling consumes the handle, so a delivery can be acked or nacked exactly once.
pub struct DeliveryHandle {
    delivery_tag: u64,
    channel: Arc<dyn BrokerChannel>,
}

impl DeliveryHandle {
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub async fn ack(self) -> Result<(), RabbitMQError> {
        self.channel.ack(self.delivery_tag).await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), RabbitMQError> {
        self.channel.nack(self.delivery_tag, requeue).await
    }
}

pub(crate) struct Subscription {
    queue: String,
    handler: Arc<dyn MessageHandler>,
}

/// Attaches handlers to queues of the declared topology.
#[derive(Debug, Clone)]
pub struct Consumer {
    manager: ConnectionManager,
}

impl Consumer {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Starts delivering messages from `queue` to `handler`.
    ///
    /// The subscription is restarted on every reconnection. If no connection can be made right
    /// now the error is returned, but the subscription stays registered and starts once the
    /// manager reconnects.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), RabbitMQError> {
        if !self.manager.topology().queue_names().contains(&queue) {
            return Err(RabbitMQError::SubscriptionError(format!(
                "queue `{}` is not part of the declared topology",
                queue
            )));
        }

        self.manager.register_subscription(Arc::new(Subscription {
            queue: queue.to_owned(),
            handler,
        }));

        if let Err(err) = self.manager.channel().await {
            warn!("subscription to {} waits for a connection: {}", queue, err);
            return Err(err);
        }
        Ok(())
    }
}

pub(crate) fn spawn_subscription(
    subscription: Arc<Subscription>,
    channel: Arc<dyn BrokerChannel>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        if let Err(err) = run_subscription(&subscription, channel, cancel).await {
            error!("subscription to {} stopped: {}", subscription.queue, err);
        }
    });
}

async fn run_subscription(
    subscription: &Subscription,
    channel: Arc<dyn BrokerChannel>,
    cancel: CancellationToken,
) -> Result<(), RabbitMQError> {
    let consumer_tag = format!("{}-{}", subscription.queue, Uuid::new_v4());
    let mut deliveries = channel.consume(&subscription.queue, &consumer_tag).await?;
    info!("consuming from {} as {}", subscription.queue, consumer_tag);

    loop {
        let delivery = select! {
            _ = cancel.cancelled() => {
                debug!("subscription {} cancelled", consumer_tag);
                return Ok(());
            }
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => {
                    debug!("delivery stream of {} ended", consumer_tag);
                    return Ok(());
                }
            },
        };

        let handle = DeliveryHandle {
            delivery_tag: delivery.delivery_tag,
            channel: channel.clone(),
        };
        process(subscription, delivery, handle).await;
    }
}

async fn process(subscription: &Subscription, delivery: Delivery, handle: DeliveryHandle) {
    let queue = &subscription.queue;
    let tag = handle.delivery_tag();

    let settled = match serde_json::from_slice(&delivery.body) {
        Ok(payload) => {
            let message = InboundMessage {
                queue: queue.clone(),
                payload,
                redelivered: delivery.redelivered,
            };
            match subscription.handler.handle(message).await {
                Ok(()) => {
                    debug!("message {} on {} handled", tag, queue);
                    handle.ack().await
                }
                Err(err) => {
                    warn!("handler for {} failed on message {}: {}, requeueing", queue, tag, err);
                    handle.nack(true).await
                }
            }
        }
        Err(err) => {
            let err = RabbitMQError::DecodeError {
                queue: queue.clone(),
                reason: err.to_string(),
            };
            warn!("{}, requeueing", err);
            handle.nack(true).await
        }
    };

    if let Err(err) = settled {
        error!("failed to settle message {} on {}: {}", tag, queue, err);
    }
}
