use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rabbitmq::{
    BrokerConnection, BrokerEndpoint, ConnectionManager, ConnectionState, Consumer, ExchangeKind,
    FailurePolicy, HandlerError, InboundMessage, LinkNotifier, MessageHandler, Publisher,
    RabbitMQError, ReconnectPolicy, Topology, Transport, memory::MemoryBroker,
};
use serde_json::{Value, json};
use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{self, Instant},
};

fn topology() -> Topology {
    Topology::builder()
        .exchange("events", ExchangeKind::Topic, true)
        .queue("greetings", true)
        .queue("farewells", true)
        .bind("greetings", "events", "greeting.*")
        .bind("farewells", "events", "farewell.#")
        .build()
        .unwrap()
}

fn manager(transport: impl Transport) -> ConnectionManager {
    ConnectionManager::builder(BrokerEndpoint::default(), topology())
        .transport(transport)
        .reconnect_policy(ReconnectPolicy::new(5, Duration::from_secs(5)))
        .liveness_interval(Duration::from_secs(3600))
        .build()
}

/// Memory broker that records when each connection attempt started.
#[derive(Clone, Default)]
struct TimedTransport {
    broker: MemoryBroker,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

#[async_trait]
impl Transport for TimedTransport {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        notifier: LinkNotifier,
    ) -> Result<Arc<dyn BrokerConnection>, RabbitMQError> {
        self.attempts.lock().push(Instant::now());
        self.broker.connect(endpoint, notifier).await
    }
}

/// Reports every message it sees; fails the first `failures` of them.
struct Recorder {
    seen: mpsc::UnboundedSender<(Value, bool)>,
    failures: AtomicU32,
}

impl Recorder {
    fn new(failures: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<(Value, bool)>) {
        let (seen, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                seen,
                failures: AtomicU32::new(failures),
            }),
            rx,
        )
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError> {
        let _ = self.seen.send((message.payload, message.redelivered));
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HandlerError::Other("simulated failure".to_owned()));
        }
        Ok(())
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<(Value, bool)>) -> (Value, bool) {
    time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("handler was not called in time")
        .expect("handler channel closed")
}

#[test_log::test(tokio::test)]
async fn declaring_the_topology_twice_is_a_no_op() {
    let broker = MemoryBroker::new();
    let manager = manager(broker.clone());

    let channel = manager.connect().await.unwrap();
    let first = broker.snapshot();
    assert_eq!(first.exchanges.len(), 1);
    assert_eq!(first.queues.len(), 2);
    assert_eq!(first.bindings.len(), 2);

    topology().declare(channel.as_ref()).await.unwrap();
    manager.connect().await.unwrap();
    assert_eq!(broker.snapshot(), first);

    manager.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn retries_back_off_linearly_and_stop_after_max_attempts() {
    let transport = TimedTransport::default();
    transport.broker.set_refuse_connections(true);
    let manager = manager(transport.clone());

    let start = Instant::now();
    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, RabbitMQError::ConnectionError(_)));

    time::sleep(Duration::from_secs(1000)).await;

    let offsets: Vec<u64> = transport
        .attempts
        .lock()
        .iter()
        .map(|at| at.duration_since(start).as_secs())
        .collect();
    // the explicit attempt, then five retries at 5s, 10s, 15s, 20s and 25s gaps
    assert_eq!(offsets, vec![0, 5, 15, 30, 50, 75]);

    let status = manager.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(!status.is_connecting());

    // an explicit connect re-arms the cycle
    transport.broker.set_refuse_connections(false);
    manager.connect().await.unwrap();
    assert_eq!(manager.status().reconnect_attempts, 0);

    manager.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn successful_reconnect_resets_the_attempt_counter() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(2);
    let manager = manager(broker.clone());

    assert!(manager.connect().await.is_err());
    assert_eq!(manager.status().reconnect_attempts, 1);

    assert!(
        manager
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(60))
            .await
    );
    let status = manager.status();
    assert!(status.is_connected());
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(broker.connect_attempts(), 3);

    manager.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn connect_times_out_and_schedules_a_retry() {
    let broker = MemoryBroker::new();
    broker.set_connect_delay(Some(Duration::from_secs(30)));
    let manager = manager(broker.clone());

    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, RabbitMQError::ConnectTimeout(d) if d == Duration::from_secs(10)));
    assert_eq!(manager.status().reconnect_attempts, 1);

    manager.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn second_connect_while_one_is_in_flight_is_rejected() {
    let broker = MemoryBroker::new();
    broker.set_connect_delay(Some(Duration::from_secs(1)));
    let manager = manager(broker.clone());

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await.map(|_| ()) }
    });
    tokio::task::yield_now().await;

    let status = manager.status();
    assert!(status.is_connecting());
    assert!(!status.is_connected());
    assert!(matches!(
        manager.connect().await,
        Err(RabbitMQError::ConnectInProgress)
    ));

    first.await.unwrap().unwrap();
    let status = manager.status();
    assert!(status.is_connected());
    assert!(!status.is_connecting());
    assert_eq!(broker.connect_attempts(), 1);

    manager.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn concurrent_publishes_share_one_connection_attempt() {
    let broker = MemoryBroker::new();
    broker.set_connect_delay(Some(Duration::from_millis(200)));
    let manager = manager(broker.clone());
    let publisher = Publisher::new(manager.clone(), "test-app");

    let mut tasks = JoinSet::new();
    for n in 0..10 {
        let publisher = publisher.clone();
        tasks.spawn(async move {
            publisher
                .publish("events", "greeting.hello", &json!({ "n": n }))
                .await
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap().unwrap();
    }

    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.queue_depth("greetings"), 10);

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn published_messages_carry_delivery_properties() {
    let broker = MemoryBroker::new();
    let manager = manager(broker.clone());
    let publisher = Publisher::new(manager.clone(), "test-app");

    publisher
        .publish("events", "farewell.bye.now", &json!({ "bye": true }))
        .await
        .unwrap();
    publisher
        .publish("events", "farewell.bye", &json!({ "bye": false }))
        .await
        .unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 2);
    let first = &published[0];
    assert!(first.mandatory);
    assert!(first.properties.persistent);
    assert_eq!(first.properties.content_type, "application/json");
    assert_eq!(first.properties.app_id, "test-app");
    assert_ne!(
        first.properties.message_id,
        published[1].properties.message_id
    );
    assert_eq!(
        serde_json::from_slice::<Value>(&first.body).unwrap(),
        json!({ "bye": true })
    );
    assert_eq!(broker.queue_depth("farewells"), 2);

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn unroutable_messages_are_rejected_or_swallowed() {
    let broker = MemoryBroker::new();
    let manager = manager(broker.clone());
    let publisher = Publisher::new(manager.clone(), "test-app");

    let err = publisher
        .publish("events", "nobody.listens", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RabbitMQError::PublishRejected { ref exchange, ref routing_key }
            if exchange == "events" && routing_key == "nobody.listens"
    ));

    let swallowing = publisher.clone().with_failure_policy(FailurePolicy::LogAndSwallow);
    swallowing
        .publish("events", "nobody.listens", &json!({}))
        .await
        .unwrap();

    // a returned message does not break the connection
    assert!(manager.status().is_connected());

    manager.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn failed_messages_are_redelivered_and_acked_ones_are_not() {
    let broker = MemoryBroker::new();
    let manager = manager(broker.clone());
    let (handler, mut seen) = Recorder::new(1);

    Consumer::new(manager.clone())
        .consume("greetings", handler)
        .await
        .unwrap();
    broker.inject("events", "greeting.hello", json!({ "hi": 1 }).to_string());

    let (payload, redelivered) = next(&mut seen).await;
    assert_eq!(payload, json!({ "hi": 1 }));
    assert!(!redelivered);

    let (payload, redelivered) = next(&mut seen).await;
    assert_eq!(payload, json!({ "hi": 1 }));
    assert!(redelivered);

    time::sleep(Duration::from_secs(1)).await;
    assert!(seen.try_recv().is_err());
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("greetings"), 0);

    manager.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn deliveries_are_processed_in_order() {
    let broker = MemoryBroker::new();
    let manager = manager(broker.clone());
    let (handler, mut seen) = Recorder::new(0);

    manager.connect().await.unwrap();
    for n in 0..5 {
        broker.inject("", "greetings", json!({ "n": n }).to_string());
    }
    Consumer::new(manager.clone())
        .consume("greetings", handler)
        .await
        .unwrap();

    for n in 0..5 {
        let (payload, _) = next(&mut seen).await;
        assert_eq!(payload, json!({ "n": n }));
    }

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn consuming_an_undeclared_queue_fails() {
    let broker = MemoryBroker::new();
    let manager = manager(broker.clone());
    let (handler, _seen) = Recorder::new(0);

    let err = Consumer::new(manager.clone())
        .consume("unknown", handler)
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::SubscriptionError(_)));
    assert_eq!(broker.connect_attempts(), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn severed_connection_reconnects_and_resubscribes() {
    let broker = MemoryBroker::new();
    let manager = manager(broker.clone());
    let (handler, mut seen) = Recorder::new(0);

    Consumer::new(manager.clone())
        .consume("greetings", handler)
        .await
        .unwrap();
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.consumer_count("greetings"), 1);

    broker.sever_connections();
    assert!(
        manager
            .wait_for_state(ConnectionState::Disconnected, Duration::from_secs(1))
            .await
    );
    assert!(
        manager
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(30))
            .await
    );
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(manager.status().reconnect_attempts, 0);

    broker.inject("events", "greeting.again", json!({ "back": true }).to_string());
    let (payload, _) = next(&mut seen).await;
    assert_eq!(payload, json!({ "back": true }));
    assert_eq!(broker.consumer_count("greetings"), 1);

    manager.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn channel_closed_by_the_broker_triggers_a_reconnect() {
    let broker = MemoryBroker::new();
    let manager = manager(broker.clone());
    manager.connect().await.unwrap();

    broker.sever_channels();
    assert!(
        manager
            .wait_for_state(ConnectionState::Disconnected, Duration::from_secs(1))
            .await
    );
    assert!(
        manager
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(30))
            .await
    );
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(broker.open_connections(), 1);

    manager.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn liveness_check_connects_an_idle_manager() {
    let broker = MemoryBroker::new();
    let manager = ConnectionManager::builder(BrokerEndpoint::default(), topology())
        .transport(broker.clone())
        .liveness_interval(Duration::from_secs(10))
        .build();

    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(broker.connect_attempts(), 0);

    assert!(
        manager
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(10))
            .await
    );
    assert_eq!(broker.connect_attempts(), 1);

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn shutdown_closes_everything_for_good() {
    let broker = MemoryBroker::new();
    let manager = manager(broker.clone());
    let (handler, _seen) = Recorder::new(0);

    Consumer::new(manager.clone())
        .consume("greetings", handler)
        .await
        .unwrap();
    assert_eq!(broker.open_connections(), 1);

    manager.shutdown().await;

    assert_eq!(manager.status().state, ConnectionState::Closed);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.consumer_count("greetings"), 0);
    assert!(matches!(
        manager.connect().await,
        Err(RabbitMQError::ManagerClosed)
    ));

    let err = Publisher::new(manager.clone(), "test-app")
        .publish("events", "greeting.hello", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::PublishFailed(_)));
    assert_eq!(broker.connect_attempts(), 1);
}

#[test_log::test(tokio::test)]
async fn undecodable_messages_are_requeued_without_reaching_the_handler() {
    let broker = MemoryBroker::new();
    let manager = manager(broker.clone());
    let (handler, mut seen) = Recorder::new(0);

    Consumer::new(manager.clone())
        .consume("greetings", handler)
        .await
        .unwrap();
    assert_eq!(broker.inject("events", "greeting.garbled", b"not json".to_vec()), 1);

    // every nack puts the message back and the broker hands it out again
    for _ in 0..500 {
        if broker.delivery_count() >= 3 {
            break;
        }
        time::sleep(Duration::from_millis(1)).await;
    }
    assert!(broker.delivery_count() >= 3);

    manager.shutdown().await;

    assert!(seen.try_recv().is_err());
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queued_bodies("greetings"), vec![b"not json".to_vec()]);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn liveness_check_replaces_a_silently_dead_connection() {
    let broker = MemoryBroker::new();
    let manager = ConnectionManager::builder(BrokerEndpoint::default(), topology())
        .transport(broker.clone())
        .liveness_interval(Duration::from_secs(10))
        .build();
    let (handler, mut seen) = Recorder::new(0);

    Consumer::new(manager.clone())
        .consume("greetings", handler)
        .await
        .unwrap();
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.consumer_count("greetings"), 1);

    broker.sever_connections_silently();
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.consumer_count("greetings"), 0);
    // no close event reached the manager
    assert!(manager.status().is_connected());

    time::sleep(Duration::from_secs(11)).await;
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(broker.open_connections(), 1);
    assert!(manager.status().is_connected());
    assert_eq!(broker.consumer_count("greetings"), 1);

    broker.inject("events", "greeting.again", json!({ "alive": true }).to_string());
    let (payload, redelivered) = next(&mut seen).await;
    assert_eq!(payload, json!({ "alive": true }));
    assert!(!redelivered);

    manager.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn publish_waits_for_a_reconnect_that_first_retires_a_slow_session() {
    let broker = MemoryBroker::new();
    let manager = manager(broker.clone());
    let publisher = Publisher::new(manager.clone(), "test-app");
    manager.connect().await.unwrap();

    // closing the old session takes 8s, opening the new one another 8s
    broker.set_close_delay(Some(Duration::from_secs(4)));
    broker.set_connect_delay(Some(Duration::from_secs(8)));
    let reconnect = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await.map(|_| ()) }
    });
    tokio::task::yield_now().await;
    assert!(manager.status().is_connecting());

    let started = Instant::now();
    publisher
        .publish("events", "greeting.hello", &json!({ "late": true }))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(16));

    reconnect.await.unwrap().unwrap();
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(broker.queue_depth("greetings"), 1);

    broker.set_close_delay(None);
    manager.shutdown().await;
}
