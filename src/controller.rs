//! Controller facade (spec section 4.7): the public `Engine` type, wiring
//! discovery, the protocol engine, the notification dispatcher, and the
//! keepalive monitor behind one state machine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::dispatch::{DispatchEvent, Dispatcher, Registration};
use crate::discovery;
use crate::error::{CommandError, ConnectError, LifecycleError};
use crate::keepalive::{KeepaliveMonitor, LivenessEvent};
use crate::model::{
    AckResult, AckStatus, Command, ConnectionState, DeviceDescriptor, EndpointRole, PropertyAck,
    SubscriptionSet,
};
use crate::protocol::ProtocolEngine;
use crate::stats::{EngineStats, StatsCounters};
use crate::transport::SocketManager;

struct Session {
    #[allow(dead_code)]
    descriptor: DeviceDescriptor,
    protocol: ProtocolEngine,
    keepalive: Arc<KeepaliveMonitor>,
}

/// The top-level client: one instance per device, holding every running
/// task and socket for its connection (spec section 4.7's state diagram:
/// Disconnected -> Connecting -> Connected -> Degraded/Closing -> Closed).
pub struct Engine {
    config: EngineConfig,
    sockets: Arc<SocketManager>,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    subscriptions: Mutex<SubscriptionSet>,
    stats: Arc<StatsCounters>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, crate::config::ConfigError> {
        config.validate()?;
        let (state_tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Ok(Arc::new(Self {
            dispatcher: Arc::new(Dispatcher::new(config.callback_timeout_ms)),
            sockets: Arc::new(SocketManager::new()),
            state: Mutex::new(ConnectionState::Disconnected),
            state_tx,
            session: Mutex::new(None),
            subscriptions: Mutex::new(SubscriptionSet::new()),
            stats: StatsCounters::new(),
            reconnect_task: Mutex::new(None),
            config,
        }))
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot(
            self.dispatcher.notifications_dispatched(),
            self.dispatcher.notifications_dropped(),
            self.dispatcher.sequence_gaps(),
        )
    }

    /// Discover the device, bind the control/notify sockets, start the
    /// notification dispatcher and keepalive monitor, and replay
    /// `default_subscriptions`. Idempotent no-op if already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<DeviceDescriptor, ConnectError> {
        {
            let mut state = self.state.lock().await;
            match *state {
                ConnectionState::Connected | ConnectionState::Degraded => {
                    return Err(ConnectError::Lifecycle(LifecycleError::AlreadyConnected));
                }
                ConnectionState::Closing => {
                    return Err(ConnectError::Lifecycle(LifecycleError::ClosingInProgress));
                }
                _ => {}
            }
            *state = ConnectionState::Connecting;
            let _ = self.state_tx.send(ConnectionState::Connecting);
        }

        let result = self.connect_inner().await;
        let mut state = self.state.lock().await;
        match &result {
            Ok(_) => {
                *state = ConnectionState::Connected;
                let _ = self.state_tx.send(ConnectionState::Connected);
            }
            Err(_) => {
                *state = ConnectionState::Disconnected;
                let _ = self.state_tx.send(ConnectionState::Disconnected);
                self.sockets.stop().await;
            }
        }
        result
    }

    async fn connect_inner(self: &Arc<Self>) -> Result<DeviceDescriptor, ConnectError> {
        self.sockets
            .start(
                self.config.discover_request_port,
                self.config.discover_response_port,
                None,
                None,
            )
            .await?;

        let descriptor = self.establish_session().await?;

        self.dispatcher.start(Arc::clone(&self.sockets), self.config.max_xml_bytes as usize).await;

        let defaults: Vec<String> = self.config.default_subscriptions.iter().cloned().collect();
        if !defaults.is_empty() {
            let session = self.session.lock().await;
            let session = session.as_ref().expect("just established");
            match session.protocol.subscribe(&defaults).await {
                Ok(_) => {
                    let mut subs = self.subscriptions.lock().await;
                    for name in &defaults {
                        subs.insert(name.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "best-effort replay of default subscriptions failed");
                }
            }
        }

        Ok(descriptor)
    }

    /// Run discovery, (re)bind the control/notify destinations, build a
    /// fresh [`ProtocolEngine`] and [`KeepaliveMonitor`], and install them as
    /// the current session. Shared by the initial `connect` and by
    /// reconnection after a keepalive timeout / `goodbye` (spec 4.6, 4.7).
    async fn establish_session(self: &Arc<Self>) -> Result<DeviceDescriptor, ConnectError> {
        let descriptor = discovery::discover(&self.sockets, &self.config).await?;

        let control_addr = SocketAddr::new(self.config.host, descriptor.control_port);
        let notify_addr = SocketAddr::new(self.config.host, descriptor.notify_port);
        self.sockets.set_default_dest(EndpointRole::Control, control_addr).await?;
        self.sockets.set_default_dest(EndpointRole::Notify, notify_addr).await?;

        let protocol = ProtocolEngine::new(Arc::clone(&self.sockets), &descriptor, &self.config);

        let keepalive = Arc::new(KeepaliveMonitor::new(
            descriptor.keepalive_interval_ms,
            self.config.keepalive_grace_ms,
        ));
        let mut liveness_rx = keepalive.subscribe();
        let self_for_liveness = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if liveness_rx.changed().await.is_err() {
                    break;
                }
                match *liveness_rx.borrow() {
                    LivenessEvent::TimedOut | LivenessEvent::GoodbyeReceived => {
                        self_for_liveness.mark_degraded().await;
                    }
                    LivenessEvent::Alive => {}
                }
            }
        });

        let keepalive_for_hook = Arc::clone(&keepalive);
        self.dispatcher
            .set_keepalive_hook(move || keepalive_for_hook.on_keepalive_received())
            .await;
        let keepalive_for_hook = Arc::clone(&keepalive);
        self.dispatcher
            .set_goodbye_hook(move || keepalive_for_hook.on_goodbye_received())
            .await;
        keepalive.start().await;

        *self.session.lock().await = Some(Session {
            descriptor: descriptor.clone(),
            protocol,
            keepalive,
        });

        Ok(descriptor)
    }

    async fn mark_degraded(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if *state == ConnectionState::Connected {
            *state = ConnectionState::Degraded;
            let _ = self.state_tx.send(ConnectionState::Degraded);
            tracing::warn!("lost contact with device, marking connection degraded");
            drop(state);
            self.spawn_reconnect_task().await;
        }
    }

    /// Start the background reconnect loop if one isn't already running.
    async fn spawn_reconnect_task(self: &Arc<Self>) {
        let mut guard = self.reconnect_task.lock().await;
        if guard.is_some() {
            return;
        }
        let engine = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            engine.reconnect_loop().await;
        }));
    }

    /// Re-discover and re-subscribe with jittered exponential backoff until
    /// the device answers again, `max_reconnect_attempts` is exhausted (0 =
    /// unbounded), or the engine starts closing.
    async fn reconnect_loop(self: &Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            if matches!(
                *self.state.lock().await,
                ConnectionState::Closing | ConnectionState::Closed
            ) {
                break;
            }
            if self.config.max_reconnect_attempts != 0 && attempt >= self.config.max_reconnect_attempts {
                tracing::warn!(attempt, "giving up reconnecting after exhausting max_reconnect_attempts");
                break;
            }

            tokio::time::sleep(reconnect_backoff(&self.config, attempt)).await;
            attempt += 1;

            match self.try_reconnect_once().await {
                Ok(descriptor) => {
                    tracing::info!(model = %descriptor.model, attempt, "reconnected");
                    self.stats.record_reconnect();
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "reconnect attempt failed");
                }
            }
        }
        *self.reconnect_task.lock().await = None;
    }

    async fn try_reconnect_once(self: &Arc<Self>) -> Result<DeviceDescriptor, ConnectError> {
        if let Some(old) = self.session.lock().await.take() {
            old.keepalive.stop().await;
        }

        let descriptor = self.establish_session().await?;

        let names: Vec<String> = self.subscriptions.lock().await.iter().cloned().collect();
        if !names.is_empty() {
            let session = self.session.lock().await;
            if let Some(session) = session.as_ref() {
                match session.protocol.subscribe(&names).await {
                    Ok(_) => {
                        if let Err(e) = session.protocol.request_update(&names).await {
                            tracing::warn!(error = %e, "post-reconnect property refresh failed");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "post-reconnect resubscribe failed"),
                }
            }
        }

        let mut state = self.state.lock().await;
        *state = ConnectionState::Connected;
        let _ = self.state_tx.send(ConnectionState::Connected);
        *self.reconnect_task.lock().await = None;
        Ok(descriptor)
    }

    /// Require `Connected`; a `Degraded` session (lost keepalive) also
    /// fails new commands until a fresh `connect` (spec scenario E).
    async fn require_connected(&self) -> Result<(), LifecycleError> {
        if *self.state.lock().await == ConnectionState::Connected {
            Ok(())
        } else {
            Err(LifecycleError::NotConnected)
        }
    }

    /// Send one command and wait for its ack.
    pub async fn send_command(&self, command: Command) -> Result<AckResult, CommandError> {
        Command::validate_name(&command.name)?;
        self.require_connected().await?;
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(CommandError::Lifecycle(LifecycleError::NotConnected))?;
        self.stats.record_command_sent();
        let result = session.protocol.send_command(command).await?;
        match result.status {
            crate::model::AckStatus::Ack => self.stats.record_ack(),
            crate::model::AckStatus::Nak => self.stats.record_nak(),
        }
        Ok(result)
    }

    pub async fn send_commands(&self, commands: &[Command]) -> Result<Vec<AckResult>, CommandError> {
        for c in commands {
            Command::validate_name(&c.name)?;
        }
        self.require_connected().await?;
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(CommandError::Lifecycle(LifecycleError::NotConnected))?;
        self.stats.record_command_sent();
        Ok(session.protocol.send_commands(commands).await?)
    }

    /// Subscribe to a set of property names. Only names not already in the
    /// authoritative Subscription Set are sent on the wire (spec 4.4, P6);
    /// already-subscribed names are reported back as already-acked without
    /// a round trip.
    pub async fn subscribe(&self, names: &[String]) -> Result<Vec<PropertyAck>, CommandError> {
        self.require_connected().await?;

        let fresh = self.subscriptions.lock().await.not_yet_subscribed(names);
        let mut results: Vec<PropertyAck> = names
            .iter()
            .filter(|n| !fresh.contains(n))
            .map(|n| PropertyAck {
                name: n.clone(),
                status: AckStatus::Ack,
                value: None,
                visible: None,
            })
            .collect();
        if fresh.is_empty() {
            return Ok(results);
        }

        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(CommandError::Lifecycle(LifecycleError::NotConnected))?;
        let acks = session.protocol.subscribe(&fresh).await?;
        let mut subs = self.subscriptions.lock().await;
        for ack in &acks {
            if ack.status == AckStatus::Ack {
                subs.insert(ack.name.clone());
            }
        }
        drop(subs);
        results.extend(acks);
        Ok(results)
    }

    pub async fn unsubscribe(&self, names: &[String]) -> Result<Vec<PropertyAck>, CommandError> {
        self.require_connected().await?;
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(CommandError::Lifecycle(LifecycleError::NotConnected))?;
        let acks = session.protocol.unsubscribe(names).await?;
        let mut subs = self.subscriptions.lock().await;
        for ack in &acks {
            if ack.status == crate::model::AckStatus::Ack {
                subs.remove(&ack.name);
            }
        }
        Ok(acks)
    }

    pub async fn request_update(&self, names: &[String]) -> Result<Vec<PropertyAck>, CommandError> {
        self.require_connected().await?;
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(CommandError::Lifecycle(LifecycleError::NotConnected))?;
        Ok(session.protocol.request_update(names).await?)
    }

    pub async fn on_property(
        &self,
        name: impl Into<String>,
        callback: impl Fn(DispatchEvent) + Send + Sync + 'static,
    ) -> Registration {
        use std::future::IntoFuture;
        self.dispatcher.on_property(name, callback).into_future().await
    }

    pub async fn on_connection(&self, callback: impl Fn(ConnectionState) + Send + Sync + 'static) -> tokio::task::JoinHandle<()> {
        let mut rx = self.state_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                callback(*rx.borrow());
            }
        })
    }

    /// Tear down every running task and socket. Idempotent; concurrent
    /// callers observe the same close (invariant I5: no leaked task or
    /// socket afterward).
    pub async fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            match *state {
                ConnectionState::Closed => return,
                ConnectionState::Closing => {
                    let mut rx = self.state_tx.subscribe();
                    drop(state);
                    while *rx.borrow() != ConnectionState::Closed {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    return;
                }
                _ => {
                    *state = ConnectionState::Closing;
                    let _ = self.state_tx.send(ConnectionState::Closing);
                }
            }
        }

        if let Some(task) = self.reconnect_task.lock().await.take() {
            task.abort();
        }
        self.dispatcher.stop().await;
        if let Some(session) = self.session.lock().await.take() {
            session.keepalive.stop().await;
        }
        self.sockets.stop().await;

        let mut state = self.state.lock().await;
        *state = ConnectionState::Closed;
        let _ = self.state_tx.send(ConnectionState::Closed);
    }
}

/// Jittered exponential backoff for the reconnect loop, shaped like
/// discovery/command retry backoff (spec 4.3) but driven by
/// `reconnect_base_ms`/`reconnect_max_ms` since reconnection has no inherent
/// per-attempt deadline.
fn reconnect_backoff(config: &EngineConfig, attempt: u32) -> Duration {
    let base = config.reconnect_base_ms as u64;
    let max = config.reconnect_max_ms as u64;
    let exp = base.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(max);
    let jitter = rand::thread_rng().gen_range(-0.25..=0.25);
    let millis = (capped as f64) * (1.0 + jitter);
    Duration::from_millis(millis.max(1.0) as u64)
}
