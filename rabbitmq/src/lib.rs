//! Resilient RabbitMQ messaging for services that publish and consume JSON events.
//!
//! One [`ConnectionManager`] per process owns the broker connection and its channel. It
//! declares a [`Topology`] on every (re)connection, reconnects with a bounded linear backoff
//! when the link drops, and restarts registered subscriptions afterwards. [`Publisher`] and
//! [`Consumer`] obtain the live channel through it.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use rabbitmq::{
//!     BrokerEndpoint, ConnectionManager, Consumer, ExchangeKind, HandlerError, InboundMessage,
//!     MessageHandler, Publisher, Topology,
//! };
//!
//! struct Print;
//!
//! #[async_trait]
//! impl MessageHandler for Print {
//!     async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError> {
//!         println!("{}", message.payload);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), rabbitmq::RabbitMQError> {
//! let topology = Topology::builder()
//!     .exchange("events", ExchangeKind::Topic, true)
//!     .queue("greetings", true)
//!     .bind("greetings", "events", "greeting.*")
//!     .build()?;
//!
//! let manager = ConnectionManager::builder(BrokerEndpoint::default(), topology).build();
//! manager.connect().await?;
//!
//! Consumer::new(manager.clone())
//!     .consume("greetings", Arc::new(Print))
//!     .await?;
//! Publisher::new(manager.clone(), "docs")
//!     .publish("events", "greeting.hello", &serde_json::json!({ "hello": "world" }))
//!     .await?;
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod amqp;
mod consumer;
mod endpoint;
mod error;
mod manager;
pub mod memory;
mod publisher;
mod reconnect;
mod topology;
mod transport;

pub use amqp::AmqpTransport;
pub use consumer::{Consumer, DeliveryHandle, InboundMessage, MessageHandler};
pub use endpoint::{BrokerEndpoint, DEFAULT_URI};
pub use error::{HandlerError, RabbitMQError};
pub use manager::{ConnectionManager, ConnectionManagerBuilder, ConnectionState, ConnectionStatus};
pub use publisher::{FailurePolicy, JSON_CONTENT_TYPE, OutboundEvent, Publisher};
pub use reconnect::ReconnectPolicy;
pub use topology::{
    Binding, ExchangeKind, ExchangeSpec, QueueSpec, Topology, TopologyBuilder, topic_matches,
};
pub use transport::{
    BrokerChannel, BrokerConnection, Delivery, LinkEvent, LinkNotifier, MessageProperties,
    OutboundMessage, PublishOutcome, Transport,
};
