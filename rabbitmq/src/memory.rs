//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// In-process broker implementing the transport seam. Used by tests and local runs without a
// RabbitMQ server.
//
// | Behaviour        | Description                                                      |
// |------------------|------------------------------------------------------------------|
// | Declarations     | Idempotent; redeclaring with other attributes is an error        |
// | Routing          | Default exchange by queue name; direct, fanout and topic         |
// | Mandatory        | Unroutable mandatory messages come back as `Returned`            |
// | Acknowledgements | Nack with requeue and channel close redeliver at the queue head  |
// | Fault injection  | Refuse or delay connects, slow closes, sever links loudly or not |
//--------------------------------------------------------------------------------------------------

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::{
    BrokerEndpoint, RabbitMQError,
    topology::{Binding, ExchangeKind, ExchangeSpec, QueueSpec, topic_matches},
    transport::{
        BrokerChannel, BrokerConnection, Delivery, LinkNotifier, OutboundMessage, PublishOutcome,
        Transport,
    },
};

/// Sorted view of everything declared on a [`MemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<Binding>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    unacked: HashMap<(u64, u64), Unacked>,
    published: Vec<OutboundMessage>,
    next_id: u64,
    connect_attempts: u32,
    fail_next_connects: u32,
    refuse_connections: bool,
    connect_delay: Option<Duration>,
    close_delay: Option<Duration>,
    deliveries: u64,
}

impl std::fmt::Debug for BrokerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerState")
            .field("exchanges", &self.exchanges.len())
            .field("queues", &self.queues.len())
            .field("connections", &self.connections.len())
            .finish()
    }
}

struct ConnectionEntry {
    open: bool,
    notifier: LinkNotifier,
}

struct ChannelEntry {
    connection: u64,
    open: bool,
    notifier: LinkNotifier,
    last_delivery_tag: u64,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

#[derive(Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerEntry {
    channel: u64,
    tag: String,
    sender: UnboundedSender<Delivery>,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_is_open(&self, channel: u64) -> bool {
        self.channels.get(&channel).is_some_and(|entry| {
            entry.open
                && self
                    .connections
                    .get(&entry.connection)
                    .is_some_and(|conn| conn.open)
        })
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, RabbitMQError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                Vec::new()
            });
        }

        let spec = self.exchanges.get(exchange).ok_or_else(|| {
            RabbitMQError::PublishFailed(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let mut queues: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match spec.kind {
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Headers => false,
            };
            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        Ok(queues)
    }

    fn enqueue(&mut self, queues: &[String], body: &[u8]) {
        for name in queues {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(StoredMessage {
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
            self.dispatch(name);
        }
    }

    /// Hands ready messages to consumers round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let index = queue.next_consumer % queue.consumers.len();
            let consumer = &queue.consumers[index];
            let channel_id = consumer.channel;

            let Some(channel) = self.channels.get_mut(&channel_id).filter(|c| c.open) else {
                queue.consumers.remove(index);
                continue;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            let delivery_tag = channel.last_delivery_tag + 1;
            let delivery = Delivery {
                delivery_tag,
                redelivered: message.redelivered,
                body: message.body.clone(),
            };
            if consumer.sender.send(delivery).is_err() {
                debug!("consumer {} on {} is gone", consumer.tag, queue_name);
                queue.ready.push_front(message);
                queue.consumers.remove(index);
                continue;
            }

            channel.last_delivery_tag = delivery_tag;
            queue.next_consumer = index + 1;
            self.deliveries += 1;
            self.unacked.insert(
                (channel_id, delivery_tag),
                Unacked {
                    queue: queue_name.to_owned(),
                    message,
                },
            );
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        let queue_name = unacked.queue.clone();
        if let Some(queue) = self.queues.get_mut(&queue_name) {
            queue.ready.push_front(StoredMessage {
                redelivered: true,
                ..unacked.message
            });
        }
    }

    /// Closes a channel: its consumers are dropped and its unacked messages go back to the
    /// head of their queues.
    fn close_channel(&mut self, channel_id: u64) {
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.open = false;
        }
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != channel_id);
        }

        let mut tags: Vec<u64> = self
            .unacked
            .keys()
            .filter(|(channel, _)| *channel == channel_id)
            .map(|(_, tag)| *tag)
            .collect();
        // push_front in reverse keeps the original order
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let mut touched = Vec::new();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&(channel_id, tag)) {
                if !touched.contains(&unacked.queue) {
                    touched.push(unacked.queue.clone());
                }
                self.requeue(unacked);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, connection_id: u64) {
        if let Some(connection) = self.connections.get_mut(&connection_id) {
            connection.open = false;
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection_id && c.open)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` connection attempts fail with a connection error.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().fail_next_connects = count;
    }

    /// While set, every connection attempt fails.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Delays every connection attempt before it succeeds or fails.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state.lock().connect_delay = delay;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.values().filter(|c| c.open).count()
    }

    /// Delays every client-initiated channel and connection close.
    pub fn set_close_delay(&self, delay: Option<Duration>) {
        self.state.lock().close_delay = delay;
    }

    /// Drops every open connection as if the broker went away, notifying the clients.
    pub fn sever_connections(&self) {
        for notifier in self.drop_connections() {
            notifier.connection_closed("CONNECTION_FORCED - broker severed the connection");
        }
    }

    /// Drops every open connection without telling the clients, as when a TCP link dies
    /// between heartbeats.
    pub fn sever_connections_silently(&self) {
        self.drop_connections();
    }

    fn drop_connections(&self) -> Vec<LinkNotifier> {
        let mut state = self.state.lock();
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| *id)
            .collect();
        let mut notifiers = Vec::new();
        for id in open {
            state.close_connection(id);
            if let Some(connection) = state.connections.get(&id) {
                notifiers.push(connection.notifier.clone());
            }
        }
        notifiers
    }

    /// Closes every open channel from the broker side, leaving connections up.
    pub fn sever_channels(&self) {
        let notifiers = {
            let mut state = self.state.lock();
            let open: Vec<u64> = state
                .channels
                .iter()
                .filter(|(_, c)| c.open)
                .map(|(id, _)| *id)
                .collect();
            let mut notifiers = Vec::new();
            for id in open {
                state.close_channel(id);
                if let Some(channel) = state.channels.get(&id) {
                    notifiers.push(channel.notifier.clone());
                }
            }
            notifiers
        };
        for notifier in notifiers {
            notifier.channel_closed("CHANNEL_ERROR - broker closed the channel");
        }
    }

    /// Publishes from outside any client connection; returns how many queues received it.
    pub fn inject(&self, exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> usize {
        let body = body.into();
        let mut state = self.state.lock();
        let queues = state.route(exchange, routing_key).unwrap_or_default();
        state.enqueue(&queues, &body);
        queues.len()
    }

    /// Every message clients published, in order, whether routed or returned.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().published.clone()
    }

    /// Messages waiting in `queue` that no consumer holds.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub fn queued_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Total deliveries handed to consumers, redeliveries included.
    pub fn delivery_count(&self) -> u64 {
        self.state.lock().deliveries
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    async fn delay_close(&self) {
        let delay = self.state.lock().close_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        let state = self.state.lock();
        let mut exchanges: Vec<ExchangeSpec> = state.exchanges.values().cloned().collect();
        exchanges.sort_by(|a, b| a.name.cmp(&b.name));
        let mut queues: Vec<QueueSpec> = state.queues.values().map(|q| q.spec.clone()).collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        let mut bindings = state.bindings.clone();
        bindings.sort_by(|a, b| {
            (&a.exchange, &a.queue, &a.routing_key).cmp(&(&b.exchange, &b.queue, &b.routing_key))
        });
        TopologySnapshot {
            exchanges,
            queues,
            bindings,
        }
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(
        &self,
        _endpoint: &BrokerEndpoint,
        notifier: LinkNotifier,
    ) -> Result<Arc<dyn BrokerConnection>, RabbitMQError> {
        let delay = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.refuse_connections || state.fail_next_connects > 0 {
            state.fail_next_connects = state.fail_next_connects.saturating_sub(1);
            return Err(RabbitMQError::ConnectionError(
                "connection refused".to_owned(),
            ));
        }

        let id = state.next_id();
        state
            .connections
            .insert(id, ConnectionEntry { open: true, notifier });
        debug!("memory broker accepted connection {}", id);

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(
        &self,
        notifier: LinkNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, RabbitMQError> {
        let mut state = self.broker.state.lock();
        if !state.connections.get(&self.id).is_some_and(|c| c.open) {
            return Err(RabbitMQError::OpenChannelError(
                "connection is closed".to_owned(),
            ));
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                open: true,
                notifier,
                last_delivery_tag: 0,
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn is_open(&self) -> bool {
        self.broker
            .state
            .lock()
            .connections
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    async fn close(&self) -> Result<(), RabbitMQError> {
        self.broker.delay_close().await;
        self.broker.state.lock().close_connection(self.id);
        Ok(())
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryChannel {
    fn closed(&self, make: fn(String) -> RabbitMQError) -> RabbitMQError {
        make(format!("channel {} is closed", self.id))
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), RabbitMQError> {
        let mut state = self.broker.state.lock();
        if !state.channel_is_open(self.id) {
            return Err(self.closed(RabbitMQError::ExchangeDeclarationError));
        }
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => {
                Err(RabbitMQError::ExchangeDeclarationError(format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                    exchange.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), RabbitMQError> {
        let mut state = self.broker.state.lock();
        if !state.channel_is_open(self.id) {
            return Err(self.closed(RabbitMQError::QueueDeclarationError));
        }
        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => {
                Err(RabbitMQError::QueueDeclarationError(format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                    queue.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    QueueState {
                        spec: queue.clone(),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), RabbitMQError> {
        let mut state = self.broker.state.lock();
        if !state.channel_is_open(self.id) {
            return Err(self.closed(RabbitMQError::QueueBindingError));
        }
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(RabbitMQError::QueueBindingError(format!(
                "NOT_FOUND - no exchange '{}'",
                binding.exchange
            )));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(RabbitMQError::QueueBindingError(format!(
                "NOT_FOUND - no queue '{}'",
                binding.queue
            )));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PublishOutcome, RabbitMQError> {
        let mut state = self.broker.state.lock();
        if !state.channel_is_open(self.id) {
            return Err(self.closed(RabbitMQError::PublishFailed));
        }

        let queues = state.route(&message.exchange, &message.routing_key)?;
        state.enqueue(&queues, &message.body);
        let mandatory = message.mandatory;
        state.published.push(message);

        if queues.is_empty() && mandatory {
            Ok(PublishOutcome::Returned)
        } else {
            Ok(PublishOutcome::Confirmed)
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<UnboundedReceiver<Delivery>, RabbitMQError> {
        let mut state = self.broker.state.lock();
        if !state.channel_is_open(self.id) {
            return Err(self.closed(RabbitMQError::SubscriptionError));
        }
        let Some(entry) = state.queues.get_mut(queue) else {
            return Err(RabbitMQError::SubscriptionError(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        };

        let (sender, deliveries) = mpsc::unbounded_channel();
        entry.consumers.push(ConsumerEntry {
            channel: self.id,
            tag: consumer_tag.to_owned(),
            sender,
        });
        state.dispatch(queue);
        Ok(deliveries)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), RabbitMQError> {
        let mut state = self.broker.state.lock();
        if !state.channel_is_open(self.id) {
            return Err(self.closed(RabbitMQError::AckMessageError));
        }
        match state.unacked.remove(&(self.id, delivery_tag)) {
            Some(_) => Ok(()),
            None => Err(RabbitMQError::AckMessageError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), RabbitMQError> {
        let mut state = self.broker.state.lock();
        if !state.channel_is_open(self.id) {
            return Err(self.closed(RabbitMQError::AckMessageError));
        }
        let Some(unacked) = state.unacked.remove(&(self.id, delivery_tag)) else {
            return Err(RabbitMQError::AckMessageError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            )));
        };
        if requeue {
            let queue = unacked.queue.clone();
            state.requeue(unacked);
            state.dispatch(&queue);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state.lock().channel_is_open(self.id)
    }

    async fn close(&self) -> Result<(), RabbitMQError> {
        self.broker.delay_close().await;
        self.broker.state.lock().close_channel(self.id);
        Ok(())
    }
}
