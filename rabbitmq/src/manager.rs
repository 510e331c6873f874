//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Owns the process-wide broker connection and channel and keeps them alive.
//
// | Component                | Description                                               |
// |--------------------------|-----------------------------------------------------------|
// | ConnectionManager        | Cloneable handle; connect, channel, status, shutdown      |
// | ConnectionManagerBuilder | Endpoint, topology, transport, policy, liveness interval  |
// | ConnectionState          | Disconnected / Connecting / Connected / Closed            |
// | ConnectionStatus         | Consistent snapshot returned by `status()`                |
//
// State machine:
//
//   Disconnected --connect--> Connecting --ok--> Connected --link lost--> Disconnected
//        ^                        |                                           |
//        +-------- failure -------+<------- delayed retry (n x base) ---------+
//
//   Retries stop once the attempt counter exceeds `max_attempts` until `connect()` is called
//   explicitly. `shutdown()` moves any state to Closed for good.
//--------------------------------------------------------------------------------------------------

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    select,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch,
    },
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    BrokerEndpoint, RabbitMQError, ReconnectPolicy, Topology,
    amqp::AmqpTransport,
    consumer::{self, Subscription},
    transport::{BrokerChannel, BrokerConnection, LinkEvent, LinkNotifier, Transport},
};

/// Lifecycle state of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Point-in-time view of the connection manager.
///
/// Both flags derive from one state value, so a snapshot can never be connected and connecting
/// at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }
}

#[derive(Debug, Clone, Copy)]
struct ManagerState {
    state: ConnectionState,
    reconnect_attempts: u32,
    retry_pending: bool,
    exhausted: bool,
}

impl ManagerState {
    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// `connect()` called by the application; clears the exhausted latch
    Explicit,
    /// A publish or consume needed a channel
    OnDemand,
    /// Scheduled by the backoff
    Retry,
    /// Periodic liveness check
    Liveness,
}

/// One connection + channel pair created by a successful connect.
#[derive(Clone)]
struct Session {
    generation: u64,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    /// Stops the consumer loops bound to this session
    cancel: CancellationToken,
}

impl Session {
    fn is_live(&self) -> bool {
        self.connection.is_open() && self.channel.is_open()
    }

    /// Closes channel and connection, ignoring errors.
    async fn retire(self, timeout: Duration) {
        self.cancel.cancel();
        if let Err(err) = time::timeout(timeout, self.channel.close())
            .await
            .unwrap_or(Err(RabbitMQError::OperationTimeout("channel.close")))
        {
            debug!("ignoring error while closing channel: {}", err);
        }
        if let Err(err) = time::timeout(timeout, self.connection.close())
            .await
            .unwrap_or(Err(RabbitMQError::OperationTimeout("connection.close")))
        {
            debug!("ignoring error while closing connection: {}", err);
        }
    }
}

#[derive(Default)]
struct Registry {
    session: Option<Session>,
    subscriptions: Vec<Arc<Subscription>>,
}

struct Inner {
    endpoint: BrokerEndpoint,
    topology: Topology,
    policy: ReconnectPolicy,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ManagerState>,
    registry: Mutex<Registry>,
    generation: AtomicU64,
    link_events: UnboundedSender<LinkEvent>,
    shutdown: CancellationToken,
}

/// Builder for [`ConnectionManager`]
pub struct ConnectionManagerBuilder {
    endpoint: BrokerEndpoint,
    topology: Topology,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    liveness_interval: Duration,
}

impl ConnectionManagerBuilder {
    /// Replaces the default `amqprs` transport
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Creates the manager and starts its background tasks.
    ///
    /// Must be called from within a tokio runtime. The manager starts disconnected; call
    /// [`ConnectionManager::connect`] to open the first session.
    pub fn build(self) -> ConnectionManager {
        let (link_events, link_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ManagerState {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            retry_pending: false,
            exhausted: false,
        });

        let inner = Arc::new(Inner {
            endpoint: self.endpoint,
            topology: self.topology,
            policy: self.policy,
            transport: self.transport,
            state,
            registry: Mutex::new(Registry::default()),
            generation: AtomicU64::new(0),
            link_events,
            shutdown: CancellationToken::new(),
        });

        spawn_link_watcher(Arc::downgrade(&inner), link_rx, inner.shutdown.clone());
        spawn_liveness_check(
            Arc::downgrade(&inner),
            self.liveness_interval,
            inner.shutdown.clone(),
        );

        ConnectionManager { inner }
    }
}

/// Handle to the single broker connection of the process.
///
/// Clones share the same connection; publishers and consumers hold a clone and obtain a live
/// channel through it.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.endpoint.redacted_uri())
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionManager {
    /// Starts a builder using the `amqprs` transport, the default reconnect policy and a 10s
    /// liveness interval.
    pub fn builder(endpoint: BrokerEndpoint, topology: Topology) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            endpoint,
            topology,
            transport: Arc::new(AmqpTransport),
            policy: ReconnectPolicy::default(),
            liveness_interval: Duration::from_secs(10),
        }
    }

    /// Opens a fresh session and declares the topology.
    ///
    /// Returns `ConnectInProgress` immediately if another attempt is running. Any stale session
    /// is closed first. On failure a delayed reconnect is scheduled and the error is returned.
    /// Calling this after retries were exhausted re-arms the reconnect cycle.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, RabbitMQError> {
        self.inner.try_connect(Origin::Explicit).await
    }

    /// Returns the live channel, connecting first if there is none.
    ///
    /// While another attempt is in flight this waits for its outcome instead of starting a
    /// second one.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, RabbitMQError> {
        if let Some(channel) = self.inner.live_channel() {
            return Ok(channel);
        }

        let mut status = self.inner.state.subscribe();
        match self.inner.try_connect(Origin::OnDemand).await {
            Err(RabbitMQError::ConnectInProgress) => {
                debug!("waiting for the in-flight connection attempt");
                let settled = async {
                    loop {
                        let connecting =
                            status.borrow_and_update().state == ConnectionState::Connecting;
                        if !connecting || status.changed().await.is_err() {
                            return;
                        }
                    }
                };
                // the attempt may spend two operation timeouts retiring the stale session
                let endpoint = &self.inner.endpoint;
                let timeout = endpoint.connect_timeout() + 2 * endpoint.operation_timeout();
                if time::timeout(timeout, settled).await.is_err() {
                    return Err(RabbitMQError::ConnectTimeout(timeout));
                }
                self.inner.live_channel().ok_or_else(|| {
                    RabbitMQError::ConnectionError("connection attempt did not succeed".to_owned())
                })
            }
            other => other,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.borrow().status()
    }

    /// Waits until the manager reaches `state`, up to `timeout`.
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        let mut status = self.inner.state.subscribe();
        let reached = async {
            loop {
                let current = status.borrow_and_update().state;
                if current == state {
                    return true;
                }
                if status.changed().await.is_err() {
                    return false;
                }
            }
        };
        time::timeout(timeout, reached).await.unwrap_or(false)
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.inner.endpoint
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Closes channel and connection and stops every background task.
    ///
    /// Errors while closing are ignored. The manager cannot be reconnected afterwards.
    pub async fn shutdown(&self) {
        self.inner.state.send_modify(|s| {
            s.state = ConnectionState::Closed;
            s.retry_pending = false;
        });
        self.inner.shutdown.cancel();

        let session = self.inner.registry.lock().session.take();
        if let Some(session) = session {
            session.retire(self.inner.endpoint.operation_timeout()).await;
        }
        info!("RabbitMQ connection manager closed");
    }

    /// Registers a subscription; it runs on the current session and on every later one.
    pub(crate) fn register_subscription(&self, subscription: Arc<Subscription>) {
        let active = {
            let mut registry = self.inner.registry.lock();
            registry.subscriptions.push(subscription.clone());
            registry.session.clone()
        };
        if let Some(session) = active {
            consumer::spawn_subscription(subscription, session.channel, session.cancel);
        }
    }

    /// Called when an operation on `channel` failed; a dead current channel counts as a lost
    /// link.
    pub(crate) fn report_channel_failure(&self, channel: &Arc<dyn BrokerChannel>) {
        let generation = {
            let registry = self.inner.registry.lock();
            registry
                .session
                .as_ref()
                .filter(|s| Arc::ptr_eq(&s.channel, channel) && !s.is_live())
                .map(|s| s.generation)
        };
        if let Some(generation) = generation {
            self.inner.on_link_lost(LinkEvent::ChannelClosed {
                generation,
                reason: "channel failed during an operation".to_owned(),
            });
        }
    }
}

impl Inner {
    fn live_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        let registry = self.registry.lock();
        registry
            .session
            .as_ref()
            .filter(|s| s.is_live())
            .map(|s| s.channel.clone())
    }

    async fn try_connect(
        self: &Arc<Self>,
        origin: Origin,
    ) -> Result<Arc<dyn BrokerChannel>, RabbitMQError> {
        // check-and-set happens inside one critical section, no await in between
        let mut closed = false;
        let begun = self.state.send_if_modified(|s| match s.state {
            ConnectionState::Closed => {
                closed = true;
                false
            }
            ConnectionState::Connecting => false,
            ConnectionState::Disconnected | ConnectionState::Connected => {
                s.state = ConnectionState::Connecting;
                if origin == Origin::Explicit && s.exhausted {
                    s.exhausted = false;
                    s.reconnect_attempts = 0;
                }
                true
            }
        });
        if closed {
            return Err(RabbitMQError::ManagerClosed);
        }
        if !begun {
            debug!(?origin, "connection attempt already in progress");
            return Err(RabbitMQError::ConnectInProgress);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            ?origin,
            generation,
            "connecting to RabbitMQ at {}",
            self.endpoint.redacted_uri()
        );

        let stale = self.registry.lock().session.take();
        if let Some(stale) = stale {
            debug!("closing stale session {}", stale.generation);
            stale.retire(self.endpoint.operation_timeout()).await;
        }

        let connect_timeout = self.endpoint.connect_timeout();
        let attempt = time::timeout(connect_timeout, self.establish(generation))
            .await
            .unwrap_or(Err(RabbitMQError::ConnectTimeout(connect_timeout)));

        match attempt {
            Ok(session) => self.commit(session),
            Err(err) => {
                error!("failed to connect to RabbitMQ: {}", err);
                self.state.send_if_modified(|s| {
                    if s.state == ConnectionState::Connecting {
                        s.state = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
                self.attempt_reconnect();
                Err(err)
            }
        }
    }

    async fn establish(&self, generation: u64) -> Result<Session, RabbitMQError> {
        let notifier = LinkNotifier::new(generation, self.link_events.clone());
        let connection = self.transport.connect(&self.endpoint, notifier.clone()).await?;

        let channel = match connection.open_channel(notifier).await {
            Ok(channel) => channel,
            Err(err) => {
                let _ = connection.close().await;
                return Err(err);
            }
        };

        if let Err(err) = self.topology.declare(channel.as_ref()).await {
            let _ = channel.close().await;
            let _ = connection.close().await;
            return Err(err);
        }

        Ok(Session {
            generation,
            connection,
            channel,
            cancel: self.shutdown.child_token(),
        })
    }

    fn commit(self: &Arc<Self>, session: Session) -> Result<Arc<dyn BrokerChannel>, RabbitMQError> {
        let mut registry = self.registry.lock();
        let committed = self.state.send_if_modified(|s| {
            if s.state != ConnectionState::Connecting {
                return false;
            }
            s.state = ConnectionState::Connected;
            s.reconnect_attempts = 0;
            s.exhausted = false;
            true
        });
        if !committed {
            // shut down while the attempt was running
            drop(registry);
            let timeout = self.endpoint.operation_timeout();
            tokio::spawn(session.retire(timeout));
            return Err(RabbitMQError::ManagerClosed);
        }
        registry.session = Some(session.clone());
        let subscriptions = registry.subscriptions.clone();
        drop(registry);

        info!(
            generation = session.generation,
            "connected to RabbitMQ, topology declared"
        );
        for subscription in subscriptions {
            consumer::spawn_subscription(
                subscription,
                session.channel.clone(),
                session.cancel.clone(),
            );
        }
        Ok(session.channel)
    }

    fn attempt_reconnect(self: &Arc<Self>) {
        enum Next {
            Skip,
            Exhausted(u32),
            Retry(u32),
        }

        let mut next = Next::Skip;
        self.state.send_if_modified(|s| {
            if s.state == ConnectionState::Closed || s.retry_pending || s.exhausted {
                return false;
            }
            s.reconnect_attempts += 1;
            if self.policy.is_exhausted(s.reconnect_attempts) {
                s.exhausted = true;
                next = Next::Exhausted(self.policy.max_attempts);
            } else {
                s.retry_pending = true;
                next = Next::Retry(s.reconnect_attempts);
            }
            true
        });

        match next {
            Next::Skip => debug!("reconnect not scheduled"),
            Next::Exhausted(attempts) => {
                error!(
                    "{}; call connect() to try again",
                    RabbitMQError::ReconnectExhausted(attempts)
                );
            }
            Next::Retry(attempt) => {
                let delay = self.policy.delay_for(attempt);
                warn!(
                    "reconnecting in {:?} (attempt {}/{})",
                    delay, attempt, self.policy.max_attempts
                );
                let weak = Arc::downgrade(self);
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    select! {
                        _ = shutdown.cancelled() => return,
                        _ = time::sleep(delay) => {}
                    }
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let mut connected = false;
                    inner.state.send_if_modified(|s| {
                        connected = s.state == ConnectionState::Connected;
                        std::mem::replace(&mut s.retry_pending, false)
                    });
                    if connected {
                        debug!("reconnect attempt {} superseded by a live session", attempt);
                        return;
                    }
                    if let Err(err) = inner.try_connect(Origin::Retry).await {
                        debug!("reconnect attempt {} failed: {}", attempt, err);
                    }
                });
            }
        }
    }

    fn on_link_lost(self: &Arc<Self>, event: LinkEvent) {
        let lost = {
            let mut registry = self.registry.lock();
            match &registry.session {
                Some(session) if session.generation == event.generation() => registry.session.take(),
                _ => None,
            }
        };
        let Some(session) = lost else {
            debug!("ignoring link event from a superseded session: {:?}", event);
            return;
        };

        warn!("lost RabbitMQ link: {:?}", event);
        self.state.send_if_modified(|s| {
            if s.state == ConnectionState::Connected {
                s.state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        tokio::spawn(session.retire(self.endpoint.operation_timeout()));
        self.attempt_reconnect();
    }

    async fn check_liveness(self: &Arc<Self>) {
        let current = *self.state.borrow();
        if current.state == ConnectionState::Closed
            || current.state == ConnectionState::Connecting
            || current.retry_pending
            || current.exhausted
        {
            return;
        }

        let healthy = self
            .registry
            .lock()
            .session
            .as_ref()
            .is_some_and(Session::is_live);
        if healthy {
            return;
        }

        warn!("liveness check found no open connection, reconnecting");
        if let Err(err) = self.try_connect(Origin::Liveness).await {
            debug!("liveness reconnect failed: {}", err);
        }
    }
}

fn spawn_link_watcher(
    inner: Weak<Inner>,
    mut events: UnboundedReceiver<LinkEvent>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = select! {
                _ = shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.on_link_lost(event);
        }
    });
}

fn spawn_liveness_check(inner: Weak<Inner>, interval: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.check_liveness().await;
        }
    });
}
