//! Payment service: consumes payment and refund requests from RabbitMQ, charges orders through a
//! payment gateway, publishes the lifecycle events, and serves a small payment records API.

pub mod api;
pub mod config;
pub mod domain;
pub mod inbounds;
pub mod outbounds;
pub mod topology;

pub use config::{Config, ConfigError};
pub use domain::models::payment::{NewPayment, Payment, PaymentUpdate};
pub use domain::models::requests::{PaymentRequest, RefundRequest};
pub use domain::services::payment_gateway::{PaymentGateway, SimulatedGateway};
pub use domain::services::payment_repository::{InMemoryPaymentRepository, PaymentRepository};
pub use inbounds::handlers::{PaymentRequestHandler, RefundRequestHandler};
pub use outbounds::event_sink::{EventSink, RabbitEventSink};
pub use outbounds::events::payment::{PaymentEvent, PaymentStatus};
