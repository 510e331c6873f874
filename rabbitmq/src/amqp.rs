//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// `amqprs` implementation of the transport seam.
//
// | Component                | Description                                               |
// |--------------------------|-----------------------------------------------------------|
// | AmqpTransport            | Opens amqprs connections                                  |
// | AmqpConnection           | Wraps an amqprs Connection                                |
// | AmqpChannel              | Wraps an amqprs Channel in confirm mode                   |
// | RabbitConnectionCallback | Forwards connection close to the manager                  |
// | RabbitChannelCallback    | Forwards channel close, confirms and returns              |
//--------------------------------------------------------------------------------------------------

use std::{future::Future, sync::Arc, time::Duration};

use amqprs::{
    Ack, BasicProperties, Cancel, Close, CloseChannel, Nack, Return,
    callbacks::{ChannelCallback, ConnectionCallback},
    channel::{
        BasicAckArguments, BasicConsumeArguments, BasicNackArguments, BasicPublishArguments,
        Channel, ConfirmSelectArguments, ExchangeDeclareArguments, QueueBindArguments,
        QueueDeclareArguments,
    },
    connection::{Connection, OpenConnectionArguments},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver},
    oneshot,
};
use tracing::{debug, error, info, warn};

use crate::{
    BrokerEndpoint, RabbitMQError,
    topology::{Binding, ExchangeSpec, QueueSpec},
    transport::{
        BrokerChannel, BrokerConnection, Delivery, LinkNotifier, OutboundMessage, PublishOutcome,
        Transport,
    },
};

/// Transport backed by a real RabbitMQ broker.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpTransport;

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        notifier: LinkNotifier,
    ) -> Result<Arc<dyn BrokerConnection>, RabbitMQError> {
        let conn = open_rabbit_connection(endpoint, notifier).await?;
        Ok(Arc::new(AmqpConnection {
            conn,
            operation_timeout: endpoint.operation_timeout(),
        }))
    }
}

pub struct AmqpConnection {
    conn: Connection,
    operation_timeout: Duration,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(
        &self,
        notifier: LinkNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, RabbitMQError> {
        let confirms = Arc::new(ConfirmTracker::default());
        let channel = open_rabbit_channel(&self.conn, notifier, confirms.clone()).await?;

        channel
            .confirm_select(ConfirmSelectArguments::default())
            .await
            .map_err(|err| RabbitMQError::OpenChannelError(err.to_string()))?;

        Ok(Arc::new(AmqpChannel {
            channel,
            confirms,
            publish_lock: tokio::sync::Mutex::new(()),
            operation_timeout: self.operation_timeout,
        }))
    }

    fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    async fn close(&self) -> Result<(), RabbitMQError> {
        self.conn
            .clone()
            .close()
            .await
            .map_err(|err| RabbitMQError::CloseChannelError(err.to_string()))
    }
}

/// Channel in publisher-confirm mode.
///
/// Publishes are serialized by `publish_lock` so at most one confirm is outstanding; the
/// channel callback resolves it when the broker acks, nacks or returns the message.
pub struct AmqpChannel {
    channel: Channel,
    confirms: Arc<ConfirmTracker>,
    publish_lock: tokio::sync::Mutex<()>,
    operation_timeout: Duration,
}

impl AmqpChannel {
    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, amqprs::error::Error>>,
        map_err: fn(String) -> RabbitMQError,
    ) -> Result<T, RabbitMQError> {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result.map_err(|err| map_err(err.to_string())),
            Err(_) => Err(RabbitMQError::OperationTimeout(operation)),
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), RabbitMQError> {
        let args = ExchangeDeclareArguments::new(&exchange.name, exchange.kind.as_str())
            .durable(exchange.durable)
            .finish();
        self.bounded(
            "exchange.declare",
            self.channel.exchange_declare(args),
            RabbitMQError::ExchangeDeclarationError,
        )
        .await
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), RabbitMQError> {
        let args = QueueDeclareArguments::new(&queue.name)
            .durable(queue.durable)
            .finish();
        self.bounded(
            "queue.declare",
            self.channel.queue_declare(args),
            RabbitMQError::QueueDeclarationError,
        )
        .await?;
        Ok(())
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), RabbitMQError> {
        let args = QueueBindArguments::new(&binding.queue, &binding.exchange, &binding.routing_key);
        self.bounded(
            "queue.bind",
            self.channel.queue_bind(args),
            RabbitMQError::QueueBindingError,
        )
        .await
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PublishOutcome, RabbitMQError> {
        let _guard = self.publish_lock.lock().await;

        let args = BasicPublishArguments::new(&message.exchange, &message.routing_key)
            .mandatory(message.mandatory)
            .finish();
        let props = BasicProperties::default()
            .with_content_type(&message.properties.content_type)
            .with_delivery_mode(if message.properties.persistent { 2 } else { 1 })
            .with_app_id(&message.properties.app_id)
            .with_message_id(&message.properties.message_id)
            .with_timestamp(message.properties.timestamp)
            .finish();

        let verdict = self.confirms.arm();

        if let Err(err) = self.channel.basic_publish(props, message.body, args).await {
            self.confirms.cancel_unsent();
            return Err(RabbitMQError::PublishFailed(err.to_string()));
        }

        match tokio::time::timeout(self.operation_timeout, verdict).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(RabbitMQError::PublishFailed(
                "channel closed before the broker confirmed the message".to_owned(),
            )),
            Err(_) => {
                self.confirms.disarm();
                Err(RabbitMQError::OperationTimeout("basic.publish confirm"))
            }
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<UnboundedReceiver<Delivery>, RabbitMQError> {
        let (_ctag, mut rx) = self
            .bounded(
                "basic.consume",
                self.channel
                    .basic_consume_rx(BasicConsumeArguments::new(queue, consumer_tag)),
                RabbitMQError::SubscriptionError,
            )
            .await?;

        let (tx, deliveries) = mpsc::unbounded_channel();
        let queue = queue.to_owned();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(deliver) = message.deliver else {
                    warn!("message on {} without delivery info, skipping", queue);
                    continue;
                };
                let delivery = Delivery {
                    delivery_tag: deliver.delivery_tag(),
                    redelivered: deliver.redelivered(),
                    body: message.content.unwrap_or_default(),
                };
                if tx.send(delivery).is_err() {
                    debug!("consumer for {} went away", queue);
                    return;
                }
            }
            debug!("broker stopped delivering to {}", queue);
        });

        Ok(deliveries)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), RabbitMQError> {
        self.channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await
            .map_err(|err| RabbitMQError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), RabbitMQError> {
        self.channel
            .basic_nack(BasicNackArguments::new(delivery_tag, false, requeue))
            .await
            .map_err(|err| RabbitMQError::AckMessageError(err.to_string()))
    }

    fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    async fn close(&self) -> Result<(), RabbitMQError> {
        self.channel
            .clone()
            .close()
            .await
            .map_err(|err| RabbitMQError::CloseChannelError(err.to_string()))
    }
}

/// Tracks the single outstanding publisher confirm of a channel.
///
/// In confirm mode the broker numbers published messages from 1 and echoes that number as the
/// delivery tag of its ack or nack, so a late confirm for a message whose wait timed out can be
/// told apart from the confirm of the message currently waiting.
#[derive(Default)]
struct ConfirmTracker {
    state: Mutex<ConfirmState>,
}

#[derive(Default)]
struct ConfirmState {
    /// Sequence number of the last message handed to the broker
    published: u64,
    /// Highest delivery tag the broker has acked or nacked
    confirmed_through: u64,
    pending: Option<PendingConfirm>,
}

struct PendingConfirm {
    seq: u64,
    returned: bool,
    reply: oneshot::Sender<PublishOutcome>,
}

impl ConfirmTracker {
    fn arm(&self) -> oneshot::Receiver<PublishOutcome> {
        let (reply, verdict) = oneshot::channel();
        let mut state = self.state.lock();
        state.published += 1;
        state.pending = Some(PendingConfirm {
            seq: state.published,
            returned: false,
            reply,
        });
        verdict
    }

    /// Stops waiting for a message the broker did receive.
    fn disarm(&self) {
        self.state.lock().pending.take();
    }

    /// Stops waiting for a message that never left the client, releasing its sequence number.
    fn cancel_unsent(&self) {
        let mut state = self.state.lock();
        if state.pending.take().is_some() {
            state.published -= 1;
        }
    }

    // basic.return precedes the confirm of the same message, and confirms arrive in order, so
    // a return belongs to the oldest unconfirmed message.
    fn mark_returned(&self) {
        let mut state = self.state.lock();
        let oldest_unconfirmed = state.confirmed_through + 1;
        match state.pending.as_mut() {
            Some(pending) if pending.seq == oldest_unconfirmed => pending.returned = true,
            _ => debug!("return for message {} ignored", oldest_unconfirmed),
        }
    }

    fn resolve(&self, acked: bool, delivery_tag: u64) {
        let mut state = self.state.lock();
        state.confirmed_through = state.confirmed_through.max(delivery_tag);

        let covers_pending = state
            .pending
            .as_ref()
            .is_some_and(|pending| delivery_tag >= pending.seq);
        if !covers_pending {
            debug!("stale confirm for message {} ignored", delivery_tag);
            return;
        }
        let Some(pending) = state.pending.take() else {
            return;
        };
        drop(state);

        let outcome = match (acked, pending.returned) {
            (true, false) => PublishOutcome::Confirmed,
            (true, true) => PublishOutcome::Returned,
            (false, _) => PublishOutcome::Nacked,
        };
        let _ = pending.reply.send(outcome);
    }
}

async fn open_rabbit_connection(
    endpoint: &BrokerEndpoint,
    notifier: LinkNotifier,
) -> Result<Connection, RabbitMQError> {
    info!(
        "Attempting to open RabbitMQ connection to: {}",
        endpoint.redacted_uri()
    );

    let mut open_conn_args = match OpenConnectionArguments::try_from(endpoint.uri()) {
        Ok(args) => args,
        Err(err) => {
            error!("Failed to parse connection string: {}", err);
            return Err(RabbitMQError::UriError(err.to_string()));
        }
    };
    open_conn_args.heartbeat(endpoint.heartbeat());

    let conn = match Connection::open(&open_conn_args).await {
        Ok(conn) => conn,
        Err(err) => {
            error!("Failed to connect to RabbitMQ: {}", err);
            return Err(RabbitMQError::ConnectionError(err.to_string()));
        }
    };

    if let Err(err) = conn
        .register_callback(RabbitConnectionCallback { notifier })
        .await
    {
        error!("Failed to register connection callback: {}", err);
        return Err(RabbitMQError::ConnectionError(err.to_string()));
    }

    info!("RabbitMQ connection established successfully");
    Ok(conn)
}

async fn open_rabbit_channel(
    conn: &Connection,
    notifier: LinkNotifier,
    confirms: Arc<ConfirmTracker>,
) -> Result<Channel, RabbitMQError> {
    let rabbit_channel = match conn.open_channel(None).await {
        Ok(ch) => ch,
        Err(err) => {
            error!("Failed to open channel: {}", err);
            return Err(RabbitMQError::OpenChannelError(err.to_string()));
        }
    };

    if let Err(err) = rabbit_channel
        .register_callback(RabbitChannelCallback { notifier, confirms })
        .await
    {
        error!("Failed to register channel callback: {}", err);
        return Err(RabbitMQError::OpenChannelError(err.to_string()));
    }

    debug!("RabbitMQ channel opened successfully");
    Ok(rabbit_channel)
}

struct RabbitConnectionCallback {
    notifier: LinkNotifier,
}

#[async_trait]
impl ConnectionCallback for RabbitConnectionCallback {
    async fn close(
        &mut self,
        _connection: &Connection,
        close: Close,
    ) -> Result<(), amqprs::error::Error> {
        warn!("connection closed by broker {:?}", close);
        self.notifier.connection_closed(format!("{:?}", close));
        Ok(())
    }

    async fn blocked(&mut self, _connection: &Connection, reason: String) {
        warn!("connection blocked {:?}", reason);
    }

    async fn unblocked(&mut self, _connection: &Connection) {
        info!("connection unblocked");
    }

    async fn secret_updated(&mut self, _connection: &Connection) {
        debug!("connection secret updated");
    }
}

struct RabbitChannelCallback {
    notifier: LinkNotifier,
    confirms: Arc<ConfirmTracker>,
}

#[async_trait]
impl ChannelCallback for RabbitChannelCallback {
    async fn close(
        &mut self,
        _channel: &Channel,
        close: CloseChannel,
    ) -> Result<(), amqprs::error::Error> {
        warn!("channel closed by broker {:?}", close);
        self.confirms.disarm();
        self.notifier.channel_closed(format!("{:?}", close));
        Ok(())
    }

    async fn cancel(
        &mut self,
        _channel: &Channel,
        cancel: Cancel,
    ) -> Result<(), amqprs::error::Error> {
        warn!("consumer cancelled by broker {:?}", cancel);
        Ok(())
    }

    async fn flow(
        &mut self,
        _channel: &Channel,
        active: bool,
    ) -> Result<bool, amqprs::error::Error> {
        debug!("channel flow active={}", active);
        Ok(true)
    }

    async fn publish_ack(&mut self, _channel: &Channel, ack: Ack) {
        self.confirms.resolve(true, ack.delivery_tag());
    }

    async fn publish_nack(&mut self, _channel: &Channel, nack: Nack) {
        self.confirms.resolve(false, nack.delivery_tag());
    }

    async fn publish_return(
        &mut self,
        _channel: &Channel,
        _ret: Return,
        _props: BasicProperties,
        _content: Vec<u8>,
    ) {
        self.confirms.mark_returned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confirm_tracker_reports_returns() {
        let tracker = ConfirmTracker::default();

        let verdict = tracker.arm();
        tracker.resolve(true, 1);
        assert_eq!(verdict.await.unwrap(), PublishOutcome::Confirmed);

        let verdict = tracker.arm();
        tracker.mark_returned();
        tracker.resolve(true, 2);
        assert_eq!(verdict.await.unwrap(), PublishOutcome::Returned);

        let verdict = tracker.arm();
        tracker.resolve(false, 3);
        assert_eq!(verdict.await.unwrap(), PublishOutcome::Nacked);
    }

    #[tokio::test]
    async fn disarmed_confirm_drops_the_waiter() {
        let tracker = ConfirmTracker::default();
        let verdict = tracker.arm();
        tracker.disarm();
        assert!(verdict.await.is_err());
        // a late ack with nothing pending is ignored
        tracker.resolve(true, 1);
    }

    #[tokio::test]
    async fn late_confirm_of_a_timed_out_message_does_not_resolve_the_next_one() {
        let tracker = ConfirmTracker::default();

        let _timed_out = tracker.arm();
        tracker.disarm();
        let mut verdict = tracker.arm();

        // the broker returns and acks the first message after its wait was abandoned
        tracker.mark_returned();
        tracker.resolve(true, 1);
        assert!(verdict.try_recv().is_err());

        tracker.mark_returned();
        tracker.resolve(true, 2);
        assert_eq!(verdict.await.unwrap(), PublishOutcome::Returned);
    }

    #[tokio::test]
    async fn unsent_message_releases_its_sequence_number() {
        let tracker = ConfirmTracker::default();

        let _failed = tracker.arm();
        tracker.cancel_unsent();

        let verdict = tracker.arm();
        tracker.resolve(true, 1);
        assert_eq!(verdict.await.unwrap(), PublishOutcome::Confirmed);
    }
}
