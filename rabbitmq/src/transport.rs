//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// The seam between the connection manager and a concrete broker client.
//
// | Component        | Description                                                    |
// |------------------|----------------------------------------------------------------|
// | Transport        | Opens connections to a broker endpoint                         |
// | BrokerConnection | One live connection, able to open channels                     |
// | BrokerChannel    | Declarations, publishing, consuming and acknowledgements       |
// | LinkNotifier     | Reports connection/channel loss back to the connection manager |
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::{
    BrokerEndpoint, RabbitMQError,
    topology::{Binding, ExchangeSpec, QueueSpec},
};

/// Loss of a connection or channel, tagged with the session generation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectionClosed { generation: u64, reason: String },
    ChannelClosed { generation: u64, reason: String },
}

impl LinkEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::ConnectionClosed { generation, .. } | Self::ChannelClosed { generation, .. } => {
                *generation
            }
        }
    }
}

/// Handed to a transport on connect so broker callbacks can report link loss.
#[derive(Debug, Clone)]
pub struct LinkNotifier {
    generation: u64,
    sender: UnboundedSender<LinkEvent>,
}

impl LinkNotifier {
    pub(crate) fn new(generation: u64, sender: UnboundedSender<LinkEvent>) -> Self {
        Self { generation, sender }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection_closed(&self, reason: impl Into<String>) {
        self.notify(LinkEvent::ConnectionClosed {
            generation: self.generation,
            reason: reason.into(),
        });
    }

    pub fn channel_closed(&self, reason: impl Into<String>) {
        self.notify(LinkEvent::ChannelClosed {
            generation: self.generation,
            reason: reason.into(),
        });
    }

    fn notify(&self, event: LinkEvent) {
        // the receiver is gone once the manager shuts down
        if self.sender.send(event).is_err() {
            debug!("link event dropped, connection manager is gone");
        }
    }
}

/// AMQP properties attached to every outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: String,
    /// Delivery mode 2 when true
    pub persistent: bool,
    pub app_id: String,
    pub message_id: String,
    /// Seconds since the unix epoch
    pub timestamp: u64,
}

/// A fully serialized message ready to be handed to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Ask the broker to return the message if no queue is bound for it
    pub mandatory: bool,
}

/// What the broker said about a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Routed and confirmed
    Confirmed,
    /// Mandatory message matched no binding
    Returned,
    /// Broker refused the message
    Nacked,
}

/// A message pushed by the broker to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a connection; the notifier must be fired when the connection closes.
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        notifier: LinkNotifier,
    ) -> Result<Arc<dyn BrokerConnection>, RabbitMQError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a channel; the notifier must be fired when the channel closes.
    async fn open_channel(
        &self,
        notifier: LinkNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, RabbitMQError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), RabbitMQError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), RabbitMQError>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), RabbitMQError>;

    async fn bind_queue(&self, binding: &Binding) -> Result<(), RabbitMQError>;

    /// Publishes and waits for the broker's verdict on the message.
    async fn publish(&self, message: OutboundMessage) -> Result<PublishOutcome, RabbitMQError>;

    /// Starts consuming; deliveries arrive on the returned receiver until the channel closes.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<UnboundedReceiver<Delivery>, RabbitMQError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), RabbitMQError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), RabbitMQError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), RabbitMQError>;
}
