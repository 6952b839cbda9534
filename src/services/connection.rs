//! Broker connection manager
//!
//! A single actor task owns the transport, the lifecycle state machine and the
//! timers. Callers talk to it through `ConnectionManager`, a cheap cloneable
//! handle. Inbound publishes leave through a bounded channel handed out at
//! spawn time.
//!
//! The state machine itself (`Lifecycle`) performs no I/O: every reaction
//! returns a list of `Action`s that the actor applies. Each connect attempt,
//! loss and disconnect bumps the generation; timers carry the generation that
//! armed them and are ignored once it is stale.

use crate::domain::device::{DeviceConfig, DeviceView};
use crate::domain::errors::{ConnectError, PublishError};
use crate::domain::types::{ConnectionState, InboundMessage};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::mqtt::{BrokerLink, LinkConnector, LinkEvent, LinkSettings, OFFLINE_MARKER, ONLINE_MARKER};
use crate::services::topic_resolver::{SubscriptionSet, TopicResolver};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Command queue depth between handles and the actor
const COMMAND_BUFFER: usize = 64;

/// Lifecycle event fan-out capacity
const EVENT_BUFFER: usize = 64;

/// Minimum spacing between "inbound channel full" warnings
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ConnectTimeout,
    Stabilize,
    Retry,
}

impl TimerKind {
    const ALL: [TimerKind; 3] = [TimerKind::ConnectTimeout, TimerKind::Stabilize, TimerKind::Retry];

    fn slot(self) -> usize {
        match self {
            TimerKind::ConnectTimeout => 0,
            TimerKind::Stabilize => 1,
            TimerKind::Retry => 2,
        }
    }
}

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Open a new transport for the active device config
    Dial,
    ScheduleTimer { kind: TimerKind, generation: u64, after: Duration },
    CancelTimers,
    /// Resolve the full subscription set from the current registry and apply it
    SubscribeAll,
    /// Apply only topics not yet subscribed in this session
    SubscribeNew,
    /// Resolve every caller waiting on `connect`
    Settle(Result<(), ConnectError>),
    /// Drop the transport without a handshake
    Halt,
    /// Tear the transport down; `graceful` sends the offline marker and DISCONNECT
    Close { graceful: bool },
}

#[derive(Debug, Clone, Copy)]
pub struct LifecycleTimings {
    pub connect_timeout: Duration,
    pub stabilize_delay: Duration,
    pub reconnect_interval: Duration,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            stabilize_delay: Duration::from_secs(1),
            reconnect_interval: Duration::from_secs(5),
        }
    }
}

/// Connection lifecycle state machine
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    generation: u64,
    /// Set on the first CONNACK; afterwards failures are absorbed by reconnecting
    ever_connected: bool,
    /// Subscriptions have been applied for the current session
    stabilized: bool,
    timings: LifecycleTimings,
}

impl Lifecycle {
    pub fn new(timings: LifecycleTimings) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            ever_connected: false,
            stabilized: false,
            timings,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_stabilized(&self) -> bool {
        self.stabilized
    }

    pub fn connect_requested(&mut self) -> Vec<Action> {
        match self.state {
            ConnectionState::Disconnected => self.begin_attempt(),
            // Join the in-flight first attempt
            ConnectionState::Connecting if !self.ever_connected => Vec::new(),
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => vec![Action::Settle(Ok(()))],
            ConnectionState::Closed => vec![Action::Settle(Err(ConnectError::Closed))],
        }
    }

    pub fn link_up(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.state = ConnectionState::Connected;
        self.ever_connected = true;
        self.stabilized = false;
        vec![
            Action::Settle(Ok(())),
            Action::ScheduleTimer {
                kind: TimerKind::Stabilize,
                generation: self.generation,
                after: self.timings.stabilize_delay,
            },
        ]
    }

    pub fn link_failed(&mut self, error: ConnectError) -> Vec<Action> {
        match self.state {
            ConnectionState::Connecting if !self.ever_connected => {
                self.state = ConnectionState::Disconnected;
                self.generation += 1;
                vec![Action::Halt, Action::Settle(Err(error))]
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.state = ConnectionState::Reconnecting;
                self.generation += 1;
                self.stabilized = false;
                vec![
                    Action::Halt,
                    Action::ScheduleTimer {
                        kind: TimerKind::Retry,
                        generation: self.generation,
                        after: self.timings.reconnect_interval,
                    },
                ]
            }
            _ => Vec::new(),
        }
    }

    pub fn timer_fired(&mut self, kind: TimerKind, generation: u64) -> Vec<Action> {
        if generation != self.generation {
            return Vec::new();
        }
        match (kind, self.state) {
            (TimerKind::ConnectTimeout, ConnectionState::Connecting) => {
                self.link_failed(ConnectError::Timeout)
            }
            (TimerKind::Stabilize, ConnectionState::Connected) if !self.stabilized => {
                self.stabilized = true;
                vec![Action::SubscribeAll]
            }
            (TimerKind::Retry, ConnectionState::Reconnecting) => self.begin_attempt(),
            _ => Vec::new(),
        }
    }

    /// Device registry changed
    pub fn topics_changed(&mut self) -> Vec<Action> {
        if self.state == ConnectionState::Connected && self.stabilized {
            vec![Action::SubscribeNew]
        } else {
            Vec::new()
        }
    }

    pub fn disconnect_requested(&mut self) -> Vec<Action> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }
        let graceful = self.state == ConnectionState::Connected;
        self.state = ConnectionState::Closed;
        self.generation += 1;
        self.stabilized = false;
        vec![
            Action::CancelTimers,
            Action::Settle(Err(ConnectError::Closed)),
            Action::Close { graceful },
        ]
    }

    fn begin_attempt(&mut self) -> Vec<Action> {
        self.state = ConnectionState::Connecting;
        self.generation += 1;
        self.stabilized = false;
        vec![
            Action::Dial,
            Action::ScheduleTimer {
                kind: TimerKind::ConnectTimeout,
                generation: self.generation,
                after: self.timings.connect_timeout,
            },
        ]
    }
}

/// Observable lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    StateChanged { from: ConnectionState, to: ConnectionState, generation: u64 },
    /// Full subscription set applied after stabilization
    Subscribed { topics: Vec<String> },
    SubscriptionFailed { topic: String },
}

/// Settings for the connection actor
#[derive(Debug, Clone, Default)]
pub struct ManagerSettings {
    pub timings: LifecycleTimings,
    pub inbound_buffer: usize,
    pub link: LinkSettings,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timings: LifecycleTimings {
                connect_timeout: config.connect_timeout(),
                stabilize_delay: config.stabilize_delay(),
                reconnect_interval: config.reconnect_interval(),
            },
            inbound_buffer: config.inbound_buffer(),
            link: LinkSettings {
                keep_alive: config.keep_alive(),
                status_topic: config.status_topic().map(str::to_string),
            },
        }
    }
}

enum Command {
    Connect(DeviceConfig, oneshot::Sender<Result<(), ConnectError>>),
    Refresh,
    Publish(String, Bytes, oneshot::Sender<Result<(), PublishError>>),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to the connection actor
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl ConnectionManager {
    /// Spawn the actor. Returns the handle and the inbound message stream.
    pub fn spawn(
        settings: ManagerSettings,
        connector: Arc<dyn LinkConnector>,
        resolver: TopicResolver,
        devices: DeviceView,
        metrics: Arc<Metrics>,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);

        let actor = Actor {
            lifecycle: Lifecycle::new(settings.timings),
            settings,
            connector,
            resolver,
            devices,
            metrics,
            inbound_tx,
            state_tx,
            events_tx: events_tx.clone(),
            active_config: None,
            link: None,
            applied: SubscriptionSet::new(),
            timers: Timers::default(),
            waiters: Vec::new(),
            dropped_since_warn: 0,
            last_drop_warn: None,
        };
        tokio::spawn(actor.run(command_rx));

        let manager = Self { commands: command_tx, state: state_rx, events: events_tx };
        (manager, inbound_rx)
    }

    /// Connect using `config`, or join/acknowledge an existing connection.
    ///
    /// Errors are only reported while the manager has never been connected.
    pub async fn connect(&self, config: DeviceConfig) -> Result<(), ConnectError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(config, tx))
            .await
            .map_err(|_| ConnectError::Closed)?;
        rx.await.unwrap_or(Err(ConnectError::Closed))
    }

    /// Subscribe topics for newly registered devices if already stabilized
    pub async fn refresh_subscriptions(&self) {
        let _ = self.commands.send(Command::Refresh).await;
    }

    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Publish(topic.to_string(), payload, tx))
            .await
            .map_err(|_| PublishError::Closed)?;
        rx.await.unwrap_or(Err(PublishError::Closed))
    }

    /// Close the connection for good. Idempotent.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }
}

/// One pending deadline per timer kind
#[derive(Debug, Default)]
struct Timers {
    slots: [Option<(u64, Instant)>; 3],
}

impl Timers {
    fn arm(&mut self, kind: TimerKind, generation: u64, deadline: Instant) {
        self.slots[kind.slot()] = Some((generation, deadline));
    }

    fn disarm(&mut self, kind: TimerKind) {
        self.slots[kind.slot()] = None;
    }

    fn clear(&mut self) {
        self.slots = [None; 3];
    }

    fn next(&self) -> Option<(TimerKind, u64, Instant)> {
        TimerKind::ALL
            .iter()
            .filter_map(|kind| self.slots[kind.slot()].map(|(g, at)| (*kind, g, at)))
            .min_by_key(|(_, _, at)| *at)
    }
}

async fn poll_link(link: Option<&mut Box<dyn BrokerLink>>) -> LinkEvent {
    match link {
        Some(link) => link.poll().await,
        None => std::future::pending().await,
    }
}

async fn wait_timer(next: Option<(TimerKind, u64, Instant)>) -> (TimerKind, u64) {
    match next {
        Some((kind, generation, deadline)) => {
            sleep_until(deadline).await;
            (kind, generation)
        }
        None => std::future::pending().await,
    }
}

struct Actor {
    lifecycle: Lifecycle,
    settings: ManagerSettings,
    connector: Arc<dyn LinkConnector>,
    resolver: TopicResolver,
    devices: DeviceView,
    metrics: Arc<Metrics>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<LifecycleEvent>,
    /// Device config used for dialing (the first one that requested a connection)
    active_config: Option<DeviceConfig>,
    link: Option<Box<dyn BrokerLink>>,
    /// Topics subscribed during the current session
    applied: SubscriptionSet,
    timers: Timers,
    waiters: Vec<oneshot::Sender<Result<(), ConnectError>>>,
    dropped_since_warn: u64,
    last_drop_warn: Option<Instant>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let next_timer = self.timers.next();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = poll_link(self.link.as_mut()) => self.handle_link_event(event).await,
                (kind, generation) = wait_timer(next_timer) => {
                    self.timers.disarm(kind);
                    let actions = self.lifecycle.timer_fired(kind, generation);
                    self.apply(actions).await;
                }
            }
        }

        // Every handle is gone
        let actions = self.lifecycle.disconnect_requested();
        self.apply(actions).await;
        debug!("connection_actor_stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(config, reply) => {
                if self.lifecycle.state() == ConnectionState::Disconnected {
                    self.active_config = Some(config);
                }
                self.waiters.push(reply);
                let actions = self.lifecycle.connect_requested();
                self.apply(actions).await;
            }
            Command::Refresh => {
                let actions = self.lifecycle.topics_changed();
                self.apply(actions).await;
            }
            Command::Publish(topic, payload, reply) => {
                let _ = reply.send(self.publish(&topic, payload));
            }
            Command::Disconnect(reply) => {
                let actions = self.lifecycle.disconnect_requested();
                self.apply(actions).await;
                let _ = reply.send(());
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        match (self.lifecycle.state(), self.link.as_mut()) {
            (ConnectionState::Closed, _) => Err(PublishError::Closed),
            (ConnectionState::Connected, Some(link)) => Ok(link.publish(topic, payload)?),
            _ => Err(PublishError::NotConnected),
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        let actions = match event {
            LinkEvent::Connected => {
                info!(
                    endpoint = %self.endpoint(),
                    generation = %self.lifecycle.generation(),
                    "mqtt_connected"
                );
                self.lifecycle.link_up()
            }
            LinkEvent::Rejected(reason) => {
                warn!(endpoint = %self.endpoint(), reason = %reason, "mqtt_connect_rejected");
                self.lifecycle.link_failed(ConnectError::Rejected(reason))
            }
            LinkEvent::Lost(reason) => {
                if self.lifecycle.state() == ConnectionState::Connected {
                    warn!(endpoint = %self.endpoint(), reason = %reason, "mqtt_connection_lost");
                } else {
                    warn!(endpoint = %self.endpoint(), reason = %reason, "mqtt_connect_failed");
                }
                self.lifecycle.link_failed(ConnectError::Transport(reason))
            }
            LinkEvent::Message { topic, payload } => {
                self.forward(InboundMessage { topic, payload });
                Vec::new()
            }
            LinkEvent::SubscribeAcked { topic } => {
                debug!(topic = %topic, "subscription_acked");
                Vec::new()
            }
            LinkEvent::SubscribeFailed { topic } => {
                // Forget it so the next refresh asks again
                self.applied.remove(&topic);
                self.subscription_failed(&topic, "rejected by broker");
                Vec::new()
            }
            LinkEvent::Idle => Vec::new(),
        };
        self.apply(actions).await;
    }

    fn forward(&mut self, message: InboundMessage) {
        self.metrics.record_message_received();
        match self.inbound_tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.metrics.record_message_dropped();
                self.dropped_since_warn += 1;
                let now = Instant::now();
                let due = self
                    .last_drop_warn
                    .map_or(true, |last| now.duration_since(last) >= DROP_WARN_INTERVAL);
                if due {
                    warn!(
                        topic = %message.topic,
                        dropped = %self.dropped_since_warn,
                        "inbound_channel_full"
                    );
                    self.last_drop_warn = Some(now);
                    self.dropped_since_warn = 0;
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("inbound_channel_closed");
            }
        }
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        let before = *self.state_tx.borrow();
        let mut queue: VecDeque<Action> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                Action::Dial => {
                    if let Err(e) = self.dial() {
                        warn!(endpoint = %self.endpoint(), error = %e, "mqtt_connect_failed");
                        queue.extend(self.lifecycle.link_failed(e));
                    }
                }
                Action::ScheduleTimer { kind, generation, after } => {
                    self.timers.arm(kind, generation, Instant::now() + after);
                }
                Action::CancelTimers => self.timers.clear(),
                Action::SubscribeAll => self.subscribe_all(),
                Action::SubscribeNew => self.subscribe_new(),
                Action::Settle(result) => {
                    for waiter in self.waiters.drain(..) {
                        let _ = waiter.send(result.clone());
                    }
                }
                Action::Halt => {
                    self.link = None;
                    self.applied = SubscriptionSet::new();
                }
                Action::Close { graceful } => self.close(graceful).await,
            }
        }

        self.publish_state(before);
    }

    fn dial(&mut self) -> Result<(), ConnectError> {
        let config = self.active_config.as_ref().ok_or(ConnectError::Closed)?;
        let link = self.connector.open(config, &self.settings.link)?;
        info!(
            endpoint = %config.broker_endpoint,
            generation = %self.lifecycle.generation(),
            "mqtt_connecting"
        );
        self.link = Some(link);
        self.applied = SubscriptionSet::new();
        Ok(())
    }

    fn subscribe_all(&mut self) {
        let desired = self.resolver.resolve(&self.devices.snapshot());
        self.applied = SubscriptionSet::new();
        self.apply_topics(&desired);

        if let (Some(topic), Some(link)) = (self.settings.link.status_topic.as_deref(), self.link.as_mut()) {
            if let Err(e) = link.publish(topic, Bytes::from_static(ONLINE_MARKER.as_bytes())) {
                debug!(topic = %topic, error = %e, "online_marker_failed");
            }
        }

        info!(topics = %self.applied.len(), "subscriptions_applied");
        let _ = self.events_tx.send(LifecycleEvent::Subscribed { topics: self.applied.as_slice().to_vec() });
    }

    fn subscribe_new(&mut self) {
        let desired = self.resolver.resolve(&self.devices.snapshot());
        let mut missing = SubscriptionSet::new();
        for topic in desired.iter().filter(|t| !self.applied.contains(t)) {
            missing.push(topic.to_string());
        }
        if missing.is_empty() {
            return;
        }
        self.apply_topics(&missing);
        info!(added = %missing.len(), total = %self.applied.len(), "subscriptions_refreshed");
    }

    /// Subscribe each topic independently; a failure never aborts the rest
    fn apply_topics(&mut self, topics: &SubscriptionSet) {
        for topic in topics.iter() {
            let result = match self.link.as_mut() {
                Some(link) => link.subscribe(topic),
                None => return,
            };
            match result {
                Ok(()) => {
                    debug!(topic = %topic, "subscribed");
                    self.applied.push(topic.to_string());
                }
                Err(e) => self.subscription_failed(topic, &e.0),
            }
        }
    }

    fn subscription_failed(&self, topic: &str, reason: &str) {
        self.metrics.record_subscription_failure();
        if self.resolver.diagnostic_topic() == Some(topic) {
            debug!(topic = %topic, reason = %reason, "diagnostic_subscription_failed");
        } else {
            warn!(topic = %topic, reason = %reason, "subscription_failed");
        }
        let _ = self.events_tx.send(LifecycleEvent::SubscriptionFailed { topic: topic.to_string() });
    }

    async fn close(&mut self, graceful: bool) {
        self.applied = SubscriptionSet::new();
        let Some(mut link) = self.link.take() else {
            return;
        };
        if graceful {
            let farewell = self
                .settings
                .link
                .status_topic
                .clone()
                .map(|topic| (topic, Bytes::from_static(OFFLINE_MARKER.as_bytes())));
            link.close(farewell).await;
        }
        info!(endpoint = %self.endpoint(), graceful = %graceful, "mqtt_disconnected");
    }

    fn publish_state(&mut self, before: ConnectionState) {
        let after = self.lifecycle.state();
        if after == before {
            return;
        }
        if after == ConnectionState::Reconnecting {
            self.metrics.record_reconnect();
        }
        self.metrics.set_connection_state(after);
        self.state_tx.send_replace(after);
        info!(from = %before, to = %after, generation = %self.lifecycle.generation(), "mqtt_state_changed");
        let _ = self.events_tx.send(LifecycleEvent::StateChanged {
            from: before,
            to: after,
            generation: self.lifecycle.generation(),
        });
    }

    fn endpoint(&self) -> &str {
        self.active_config.as_ref().map_or("-", |c| c.broker_endpoint.as_str())
    }
}

/// In-memory transport for exercising the actor without a broker
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::domain::errors::LinkError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// What the next opened link does on its first poll
    #[derive(Debug, Clone)]
    pub enum FakeOutcome {
        Accept,
        Reject(String),
        /// Never answers the handshake
        Hang,
        /// `open` itself fails
        OpenError(ConnectError),
    }

    #[derive(Default)]
    struct FakeBroker {
        outcomes: VecDeque<FakeOutcome>,
        /// Subscriptions per opened link, in open order
        subscriptions: Vec<Vec<String>>,
        published: Vec<(String, Bytes)>,
        closed: Vec<Option<(String, Bytes)>>,
        failing_topics: Vec<String>,
        current: Option<mpsc::UnboundedSender<LinkEvent>>,
        opened: usize,
    }

    #[derive(Clone, Default)]
    pub struct FakeConnector {
        broker: Arc<Mutex<FakeBroker>>,
    }

    impl FakeConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue the outcome for the next `open`; defaults to `Accept`
        pub fn push_outcome(&self, outcome: FakeOutcome) {
            self.broker.lock().outcomes.push_back(outcome);
        }

        pub fn fail_subscribe(&self, topic: &str) {
            self.broker.lock().failing_topics.push(topic.to_string());
        }

        /// Deliver an event to the most recently opened link
        pub fn inject(&self, event: LinkEvent) -> bool {
            match &self.broker.lock().current {
                Some(tx) => tx.send(event).is_ok(),
                None => false,
            }
        }

        pub fn opened(&self) -> usize {
            self.broker.lock().opened
        }

        pub fn subscriptions(&self, link: usize) -> Vec<String> {
            self.broker.lock().subscriptions.get(link).cloned().unwrap_or_default()
        }

        pub fn all_subscriptions(&self) -> Vec<String> {
            self.broker.lock().subscriptions.concat()
        }

        pub fn published(&self) -> Vec<(String, Bytes)> {
            self.broker.lock().published.clone()
        }

        pub fn closed(&self) -> Vec<Option<(String, Bytes)>> {
            self.broker.lock().closed.clone()
        }
    }

    impl LinkConnector for FakeConnector {
        fn open(
            &self,
            _config: &DeviceConfig,
            _settings: &LinkSettings,
        ) -> Result<Box<dyn BrokerLink>, ConnectError> {
            let mut broker = self.broker.lock();
            let handshake = match broker.outcomes.pop_front().unwrap_or(FakeOutcome::Accept) {
                FakeOutcome::Accept => Some(LinkEvent::Connected),
                FakeOutcome::Reject(reason) => Some(LinkEvent::Rejected(reason)),
                FakeOutcome::Hang => None,
                FakeOutcome::OpenError(e) => return Err(e),
            };
            let (tx, rx) = mpsc::unbounded_channel();
            let index = broker.opened;
            broker.opened += 1;
            broker.subscriptions.push(Vec::new());
            broker.current = Some(tx);
            Ok(Box::new(FakeLink { index, broker: self.broker.clone(), handshake, events: rx }))
        }
    }

    struct FakeLink {
        index: usize,
        broker: Arc<Mutex<FakeBroker>>,
        handshake: Option<LinkEvent>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
    }

    #[async_trait]
    impl BrokerLink for FakeLink {
        async fn poll(&mut self) -> LinkEvent {
            if let Some(event) = self.handshake.take() {
                return event;
            }
            match self.events.recv().await {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }

        fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
            let mut broker = self.broker.lock();
            if broker.failing_topics.iter().any(|t| t == topic) {
                return Err(LinkError("request queue full".to_string()));
            }
            broker.subscriptions[self.index].push(topic.to_string());
            Ok(())
        }

        fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), LinkError> {
            self.broker.lock().published.push((topic.to_string(), payload));
            Ok(())
        }

        async fn close(&mut self, farewell: Option<(String, Bytes)>) {
            self.broker.lock().closed.push(farewell);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeConnector, FakeOutcome};
    use super::*;
    use crate::domain::device::DeviceRegistry;

    const STABILIZE: Duration = Duration::from_millis(1000);
    const RETRY: Duration = Duration::from_millis(5000);
    const CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);

    fn timings() -> LifecycleTimings {
        LifecycleTimings {
            connect_timeout: CONNECT_TIMEOUT,
            stabilize_delay: STABILIZE,
            reconnect_interval: RETRY,
        }
    }

    fn settings(status_topic: Option<&str>) -> ManagerSettings {
        ManagerSettings {
            timings: timings(),
            inbound_buffer: 16,
            link: LinkSettings {
                keep_alive: Duration::from_secs(30),
                status_topic: status_topic.map(str::to_string),
            },
        }
    }

    fn device(id: &str, publish_topic: &str) -> DeviceConfig {
        DeviceConfig::new(id, "broker:1883").with_publish_topic(publish_topic)
    }

    struct Harness {
        manager: ConnectionManager,
        inbound: mpsc::Receiver<InboundMessage>,
        connector: FakeConnector,
        registry: DeviceRegistry,
        metrics: Arc<Metrics>,
    }

    fn harness(status_topic: Option<&str>) -> Harness {
        let connector = FakeConnector::new();
        let registry = DeviceRegistry::new();
        let metrics = Arc::new(Metrics::new());
        let (manager, inbound) = ConnectionManager::spawn(
            settings(status_topic),
            Arc::new(connector.clone()),
            TopicResolver::new("devices/p2p/", "devices/", None),
            registry.view(),
            metrics.clone(),
        );
        Harness { manager, inbound, connector, registry, metrics }
    }

    // ----- Lifecycle (no I/O) -----

    #[test]
    fn test_lifecycle_connect_dials_and_arms_timeout() {
        let mut lifecycle = Lifecycle::new(timings());
        let actions = lifecycle.connect_requested();
        assert_eq!(lifecycle.state(), ConnectionState::Connecting);
        assert_eq!(
            actions,
            vec![
                Action::Dial,
                Action::ScheduleTimer {
                    kind: TimerKind::ConnectTimeout,
                    generation: 1,
                    after: CONNECT_TIMEOUT
                },
            ]
        );
        // Second caller joins
        assert!(lifecycle.connect_requested().is_empty());
    }

    #[test]
    fn test_lifecycle_first_failure_returns_to_disconnected() {
        let mut lifecycle = Lifecycle::new(timings());
        lifecycle.connect_requested();
        let actions = lifecycle.link_failed(ConnectError::Rejected("bad auth".into()));
        assert_eq!(lifecycle.state(), ConnectionState::Disconnected);
        assert_eq!(
            actions,
            vec![Action::Halt, Action::Settle(Err(ConnectError::Rejected("bad auth".into())))]
        );
    }

    #[test]
    fn test_lifecycle_loss_after_connect_reconnects() {
        let mut lifecycle = Lifecycle::new(timings());
        lifecycle.connect_requested();
        lifecycle.link_up();
        let actions = lifecycle.link_failed(ConnectError::Transport("reset".into()));
        assert_eq!(lifecycle.state(), ConnectionState::Reconnecting);
        let generation = lifecycle.generation();
        assert!(actions.contains(&Action::ScheduleTimer {
            kind: TimerKind::Retry,
            generation,
            after: RETRY
        }));

        // Retry starts a new attempt; a failing attempt goes back to Reconnecting
        lifecycle.timer_fired(TimerKind::Retry, generation);
        assert_eq!(lifecycle.state(), ConnectionState::Connecting);
        lifecycle.link_failed(ConnectError::Timeout);
        assert_eq!(lifecycle.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_lifecycle_stale_stabilize_timer_ignored() {
        let mut lifecycle = Lifecycle::new(timings());
        lifecycle.connect_requested();
        lifecycle.link_up();
        let stale = lifecycle.generation();

        lifecycle.link_failed(ConnectError::Transport("reset".into()));
        let retry_generation = lifecycle.generation();
        lifecycle.timer_fired(TimerKind::Retry, retry_generation);
        lifecycle.link_up();

        assert!(lifecycle.timer_fired(TimerKind::Stabilize, stale).is_empty());
        assert!(!lifecycle.is_stabilized());
        assert_eq!(
            lifecycle.timer_fired(TimerKind::Stabilize, lifecycle.generation()),
            vec![Action::SubscribeAll]
        );
    }

    #[test]
    fn test_lifecycle_disconnect_during_stabilization() {
        let mut lifecycle = Lifecycle::new(timings());
        lifecycle.connect_requested();
        lifecycle.link_up();
        let generation = lifecycle.generation();

        let actions = lifecycle.disconnect_requested();
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
        assert!(actions.contains(&Action::Close { graceful: true }));
        assert!(lifecycle.timer_fired(TimerKind::Stabilize, generation).is_empty());
        assert!(lifecycle.disconnect_requested().is_empty());
        assert_eq!(
            lifecycle.connect_requested(),
            vec![Action::Settle(Err(ConnectError::Closed))]
        );
    }

    #[test]
    fn test_lifecycle_disconnect_while_reconnecting_cancels_retry() {
        let mut lifecycle = Lifecycle::new(timings());
        lifecycle.connect_requested();
        lifecycle.link_up();
        lifecycle.link_failed(ConnectError::Transport("reset".into()));
        let retry_generation = lifecycle.generation();

        let actions = lifecycle.disconnect_requested();
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
        assert!(actions.contains(&Action::CancelTimers));
        assert!(actions.contains(&Action::Close { graceful: false }));
        assert!(lifecycle.timer_fired(TimerKind::Retry, retry_generation).is_empty());
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_lifecycle_topics_changed_only_when_stabilized() {
        let mut lifecycle = Lifecycle::new(timings());
        assert!(lifecycle.topics_changed().is_empty());
        lifecycle.connect_requested();
        lifecycle.link_up();
        assert!(lifecycle.topics_changed().is_empty());
        lifecycle.timer_fired(TimerKind::Stabilize, lifecycle.generation());
        assert_eq!(lifecycle.topics_changed(), vec![Action::SubscribeNew]);
    }

    // ----- Actor -----

    #[tokio::test(start_paused = true)]
    async fn test_subscribes_only_after_stabilization() {
        let h = harness(None);
        h.registry.upsert(device("dev1", "x/y/publish"));

        h.manager.connect(device("dev1", "x/y/publish")).await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Connected);

        tokio::time::sleep(STABILIZE / 2).await;
        assert!(h.connector.subscriptions(0).is_empty());

        tokio::time::sleep(STABILIZE).await;
        assert_eq!(h.connector.subscriptions(0), vec!["x/y/publish"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_stabilization_never_subscribes() {
        let h = harness(Some("bridge/status"));
        h.registry.upsert(device("dev1", "x/y/publish"));

        h.manager.connect(device("dev1", "x/y/publish")).await.unwrap();
        tokio::time::sleep(STABILIZE / 2).await;
        h.manager.disconnect().await;

        tokio::time::sleep(RETRY * 3).await;
        assert!(h.connector.all_subscriptions().is_empty());
        assert_eq!(h.manager.state(), ConnectionState::Closed);

        // Graceful close carries the offline marker
        let closed = h.connector.closed();
        assert_eq!(closed.len(), 1);
        let (topic, payload) = closed[0].clone().unwrap();
        assert_eq!(topic, "bridge/status");
        assert_eq!(payload, Bytes::from_static(OFFLINE_MARKER.as_bytes()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resubscribes_current_set() {
        let h = harness(None);
        h.registry.upsert(device("a", "a/out"));

        h.manager.connect(device("a", "a/out")).await.unwrap();
        tokio::time::sleep(STABILIZE + Duration::from_millis(10)).await;
        assert_eq!(h.connector.subscriptions(0), vec!["a/out"]);

        assert!(h.connector.inject(LinkEvent::Lost("connection reset".into())));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.manager.state(), ConnectionState::Reconnecting);

        // Registered while the broker is unreachable
        h.registry.upsert(device("b", "b/out"));

        tokio::time::sleep(RETRY + STABILIZE + Duration::from_millis(10)).await;
        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert_eq!(h.connector.opened(), 2);
        assert_eq!(h.connector.subscriptions(1), vec!["a/out", "b/out"]);
        assert_eq!(h.metrics.snapshot().reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_reconnecting_cancels_retry() {
        let h = harness(None);
        h.registry.upsert(device("a", "a/out"));
        h.manager.connect(device("a", "a/out")).await.unwrap();

        assert!(h.connector.inject(LinkEvent::Lost("connection reset".into())));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.manager.state(), ConnectionState::Reconnecting);

        h.manager.disconnect().await;
        tokio::time::sleep(RETRY * 4).await;

        assert_eq!(h.connector.opened(), 1);
        assert_eq!(h.manager.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_connect_failure_is_reported() {
        let h = harness(None);
        h.connector.push_outcome(FakeOutcome::Reject("not authorized".into()));

        let result = h.manager.connect(device("a", "a/out")).await;
        assert_eq!(result, Err(ConnectError::Rejected("not authorized".into())));
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);

        // A later explicit connect is a fresh attempt
        h.manager.connect(device("a", "a/out")).await.unwrap();
        assert_eq!(h.connector.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_error_is_reported() {
        let h = harness(None);
        h.connector.push_outcome(FakeOutcome::OpenError(ConnectError::InvalidEndpoint("x".into())));

        let result = h.manager.connect(device("a", "a/out")).await;
        assert_eq!(result, Err(ConnectError::InvalidEndpoint("x".into())));
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_attempt() {
        let h = harness(None);
        h.connector.push_outcome(FakeOutcome::Hang);

        let (first, second) = tokio::join!(
            h.manager.connect(device("a", "a/out")),
            h.manager.connect(device("b", "b/out")),
        );
        assert_eq!(first, Err(ConnectError::Timeout));
        assert_eq!(second, Err(ConnectError::Timeout));
        assert_eq!(h.connector.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_connected_keeps_single_connection() {
        let h = harness(None);
        h.manager.connect(device("a", "a/out")).await.unwrap();
        h.manager.connect(device("b", "b/out")).await.unwrap();
        assert_eq!(h.connector.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_subscribes_only_new_topics() {
        let h = harness(None);
        h.registry.upsert(device("a", "a/out"));
        h.manager.connect(device("a", "a/out")).await.unwrap();
        tokio::time::sleep(STABILIZE + Duration::from_millis(10)).await;

        h.registry.upsert(device("b", "b/out"));
        h.manager.refresh_subscriptions().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.connector.subscriptions(0), vec!["a/out", "b/out"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_failure_does_not_abort_others() {
        let h = harness(None);
        h.connector.fail_subscribe("a/out");
        h.registry.upsert(device("a", "a/out"));
        h.registry.upsert(device("b", "b/out"));

        h.manager.connect(device("a", "a/out")).await.unwrap();
        tokio::time::sleep(STABILIZE + Duration::from_millis(10)).await;

        assert_eq!(h.connector.subscriptions(0), vec!["b/out"]);
        assert_eq!(h.metrics.subscription_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_subscription_retried_on_refresh() {
        let h = harness(None);
        h.registry.upsert(device("a", "a/out"));
        h.manager.connect(device("a", "a/out")).await.unwrap();
        tokio::time::sleep(STABILIZE + Duration::from_millis(10)).await;
        assert_eq!(h.connector.subscriptions(0), vec!["a/out"]);

        assert!(h.connector.inject(LinkEvent::SubscribeFailed { topic: "a/out".into() }));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.metrics.subscription_failures(), 1);

        h.manager.refresh_subscriptions().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.connector.subscriptions(0), vec!["a/out", "a/out"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_marker_after_stabilization() {
        let h = harness(Some("bridge/status"));
        h.registry.upsert(device("a", "a/out"));
        h.manager.connect(device("a", "a/out")).await.unwrap();
        tokio::time::sleep(STABILIZE + Duration::from_millis(10)).await;

        let published = h.connector.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "bridge/status");
        assert_eq!(published[0].1, Bytes::from_static(ONLINE_MARKER.as_bytes()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_messages_forwarded() {
        let mut h = harness(None);
        h.manager.connect(device("a", "a/out")).await.unwrap();

        h.connector.inject(LinkEvent::Message {
            topic: "a/out".into(),
            payload: Bytes::from_static(b"{}"),
        });
        let message = h.inbound.recv().await.unwrap();
        assert_eq!(message.topic, "a/out");
        assert_eq!(h.metrics.snapshot().messages_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_requires_connection() {
        let h = harness(None);
        assert_eq!(
            h.manager.publish("t", Bytes::from_static(b"x")).await,
            Err(PublishError::NotConnected)
        );

        h.manager.connect(device("a", "a/out")).await.unwrap();
        h.manager.publish("devices/p2p/a", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(h.connector.published()[0].0, "devices/p2p/a");

        h.manager.disconnect().await;
        assert_eq!(
            h.manager.publish("t", Bytes::from_static(b"x")).await,
            Err(PublishError::Closed)
        );
        assert_eq!(
            h.manager.connect(device("a", "a/out")).await,
            Err(ConnectError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_events_and_watch() {
        let h = harness(None);
        let mut events = h.manager.lifecycle();
        let mut state = h.manager.watch_state();

        h.manager.connect(device("a", "a/out")).await.unwrap();
        state.changed().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let LifecycleEvent::StateChanged { to, .. } = event {
                seen.push(to);
            }
        }
        // Dial and CONNACK are handled in separate reactions
        assert_eq!(seen, vec![ConnectionState::Connecting, ConnectionState::Connected]);
        assert_eq!(h.metrics.connection_state(), ConnectionState::Connected);
    }
}
