/// Error types for RabbitMQ operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RabbitMQError {
    /// Error in the provided URI
    #[error("Provided URI Error: {0}")]
    UriError(String),
    /// Error establishing connection
    #[error("Connection error: {0}")]
    ConnectionError(String),
    /// Connection establishment did not finish in time
    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
    /// A broker operation did not finish in time
    #[error("Broker operation `{0}` timed out")]
    OperationTimeout(&'static str),
    /// Error opening a channel
    #[error("Error while opening a rabbitmq channel: {0}")]
    OpenChannelError(String),
    /// Error declaring a queue
    #[error("Error while declaring a queue: {0}")]
    QueueDeclarationError(String),
    /// Error declaring an exchange
    #[error("Error while declaring a exchange: {0}")]
    ExchangeDeclarationError(String),
    /// Error binding a queue to an exchange
    #[error("Error while binding a queue to exchange: {0}")]
    QueueBindingError(String),
    /// Topology descriptor references something it does not declare
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),
    /// Another connection attempt is already running
    #[error("A connection attempt is already in progress")]
    ConnectInProgress,
    /// The manager was shut down and will not reconnect
    #[error("Connection manager is closed")]
    ManagerClosed,
    /// Error starting to consume from a subscription
    #[error("Error while starting to consume from a subscription: {0}")]
    SubscriptionError(String),
    /// Error closing a channel or connection
    #[error("Error while closing a channel: {0}")]
    CloseChannelError(String),
    /// The broker did not confirm the message or the send itself failed
    #[error("Error while publishing a message: {0}")]
    PublishFailed(String),
    /// The broker returned the message because nothing was bound for its routing key
    #[error("Message to exchange `{exchange}` with routing key `{routing_key}` was not routed to any queue")]
    PublishRejected {
        exchange: String,
        routing_key: String,
    },
    /// Payload could not be encoded as JSON
    #[error("Error while serializing a payload: {0}")]
    Serialization(String),
    /// Inbound payload is not valid JSON
    #[error("Error while decoding a message from `{queue}`: {reason}")]
    DecodeError { queue: String, reason: String },
    /// Error while acknowledging a message failed
    #[error("Error while acknowledging a message: {0}")]
    AckMessageError(String),
    /// All automatic reconnection attempts failed
    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),
}

impl RabbitMQError {
    /// Whether the error comes from the transport and should feed the reconnect path.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_)
                | Self::ConnectTimeout(_)
                | Self::OpenChannelError(_)
                | Self::OperationTimeout(_)
        )
    }
}

/// Failure reported by a [`MessageHandler`](crate::MessageHandler).
///
/// Any variant causes the delivery to be negatively acknowledged with requeue.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The payload did not have the shape the handler expects
    #[error("Malformed message: {0}")]
    Decode(String),
    /// A follow-up event could not be published
    #[error("Failed to publish follow-up event: {0}")]
    Publish(#[from] RabbitMQError),
    /// Any other infrastructure failure
    #[error("{0}")]
    Other(String),
}
