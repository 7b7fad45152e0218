//! # Push driver
//!
//! One task per [`DataClient`](crate::client::DataClient) owns the push connection. It is the
//! only writer of transport state: commands from the client, inbound frames, the heartbeat,
//! latency and upgrade timers and the reconnect timer are all handled in a single `select!`
//! loop. Callers observe the state through a watch channel and lifecycle events through a
//! broadcast channel.
//!
//! The driver only holds a connection while at least one subscription is registered. It
//! connects on the first subscribe, resubscribes everything on every open and closes the
//! connection once the last subscription is released.
use std::{collections::HashSet, sync::Arc, time::Duration};

use futures03::{
    future::{self, BoxFuture},
    FutureExt, StreamExt,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    select,
    sync::{broadcast, mpsc, watch},
    time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, trace, warn};

use tether_common::{
    display::sanitized,
    dto::{Frame, FrameType},
};

use crate::{
    config::ClientConfig,
    fallback::{connect_first_candidate, FallbackManager, TransportSwitch},
    reconnect::ConnectionStatus,
    subscriptions::{notify, Registry, SubscriptionEvent},
    transport::{Connection, FrameStream, TransportError, TransportKind},
};

/// Pending connect of a higher priority transport and its position in the priority list.
type UpgradeAttempt = BoxFuture<'static, Option<(usize, Connection)>>;

/// Capacity of the lifecycle event channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    /// A registration was created.
    Subscribe(String),
    /// A registration was emptied.
    Unsubscribe(String),
    /// Clear a terminal state and connect again.
    Reconnect,
    Close,
}

/// Snapshot of the push connection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransportState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    /// Round trip of the last latency probe.
    pub latency: Option<Duration>,
    pub last_event_id: Option<String>,
    /// Last failure, cleared by a successful connect.
    pub error: Option<TransportError>,
    pub active_transport: Option<TransportKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StatusChanged { from: ConnectionStatus, to: ConnectionStatus },
    TransportSwitched(TransportSwitch),
    /// Reconnecting was given up. Emitted once per terminal failure.
    ConnectionTerminated { error: TransportError },
}

#[derive(Clone)]
pub(crate) struct DriverSettings {
    auth_token: Option<String>,
    connect_timeout: Duration,
    heartbeat_interval: Option<Duration>,
    latency_interval: Option<Duration>,
    upgrade_interval: Option<Duration>,
}

impl DriverSettings {
    pub(crate) fn from_config(config: &ClientConfig) -> Self {
        Self {
            auth_token: config.auth_token.clone(),
            connect_timeout: config.connect_timeout,
            heartbeat_interval: config
                .heartbeat
                .enabled
                .then_some(config.heartbeat.interval),
            latency_interval: config
                .latency
                .enabled
                .then_some(config.latency.interval),
            upgrade_interval: config
                .transport
                .enable_upgrade_attempts
                .then_some(config.transport.upgrade_attempt_interval),
        }
    }
}

pub(crate) struct PushDriver {
    manager: FallbackManager,
    registry: Arc<Mutex<Registry>>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<TransportState>,
    events: broadcast::Sender<ClientEvent>,
    settings: DriverSettings,
    frames: Option<FrameStream>,
    /// Subscription ids a subscribe frame was sent for on the live connection.
    subscribed: HashSet<String>,
    reconnect_at: Option<Instant>,
    terminated: bool,
    last_status: ConnectionStatus,
    heartbeat: Option<Interval>,
    latency: Option<Interval>,
    upgrade: Option<Interval>,
    /// Runs next to the live connection; dropped whenever that connection goes away.
    upgrade_attempt: Option<UpgradeAttempt>,
}

impl PushDriver {
    pub(crate) fn new(
        manager: FallbackManager,
        registry: Arc<Mutex<Registry>>,
        commands: mpsc::UnboundedReceiver<Command>,
        events: broadcast::Sender<ClientEvent>,
        settings: DriverSettings,
    ) -> (Self, watch::Receiver<TransportState>) {
        let initial = TransportState {
            last_event_id: manager
                .last_event_id()
                .map(str::to_string),
            active_transport: Some(manager.active_kind()),
            ..Default::default()
        };
        let (state, state_rx) = watch::channel(initial);
        let driver = Self {
            manager,
            registry,
            commands,
            state,
            events,
            settings,
            frames: None,
            subscribed: HashSet::new(),
            reconnect_at: None,
            terminated: false,
            last_status: ConnectionStatus::Disconnected,
            heartbeat: None,
            latency: None,
            upgrade: None,
            upgrade_attempt: None,
        };
        (driver, state_rx)
    }

    #[instrument(name = "push_driver", skip_all)]
    pub(crate) async fn run(mut self) {
        debug!(priority = ?self.manager.priority(), "PushDriverStarted");
        loop {
            let heartbeat_deadline = self
                .manager
                .active()
                .heartbeat_deadline();
            select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                item = next_frame(&mut self.frames) => self.handle_inbound(item).await,
                _ = maybe_tick(&mut self.heartbeat) => self.send_heartbeat().await,
                _ = maybe_tick(&mut self.latency) => self.send_latency_probe().await,
                _ = maybe_tick(&mut self.upgrade) => self.start_upgrade_attempt(),
                outcome = next_upgrade(&mut self.upgrade_attempt) => {
                    self.upgrade_attempt = None;
                    self.finish_upgrade(outcome).await;
                },
                _ = maybe_sleep_until(heartbeat_deadline) => {
                    let timeout = self.manager.active().heartbeat_timeout();
                    warn!(?timeout, transport = %self.manager.active_kind(), "HeartbeatMissed");
                    self.handle_failure(TransportError::HeartbeatTimeout(timeout));
                },
                _ = maybe_sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.open().await;
                },
            }
        }
        self.close_connection().await;
        debug!("PushDriverStopped");
    }

    async fn handle_command(&mut self, command: Command) {
        trace!(?command, "DriverCommand");
        match command {
            Command::Subscribe(id) => self.subscribe(&id).await,
            Command::Unsubscribe(id) => self.unsubscribe(&id).await,
            Command::Reconnect => {
                info!("ManualReconnect");
                self.terminated = false;
                self.reconnect_at = None;
                if self.frames.is_none() {
                    self.manager.active_mut().reset();
                    self.publish_state();
                    if !self.registry.lock().is_empty() {
                        self.open().await;
                    }
                }
            }
            Command::Close => {}
        }
    }

    async fn subscribe(&mut self, id: &str) {
        let request = self.registry.lock().request(id);
        let Some(request) = request else {
            // released again before the driver got to it
            return;
        };
        if self.manager.active().is_connected() {
            if self.subscribed.contains(id) {
                return;
            }
            match self
                .manager
                .active_mut()
                .send(&Frame::subscribe(id, &request))
                .await
            {
                Ok(()) => {
                    debug!(id, "Subscribed");
                    self.subscribed.insert(id.to_string());
                }
                Err(e) => self.handle_failure(e),
            }
        } else if !self.terminated && self.reconnect_at.is_none() {
            self.open().await;
        }
    }

    async fn unsubscribe(&mut self, id: &str) {
        if self.registry.lock().contains(id) {
            // subscribed again in the meantime
            return;
        }
        if self.subscribed.remove(id) && self.manager.active().is_connected() {
            if let Err(e) = self
                .manager
                .active_mut()
                .send(&Frame::unsubscribe(id))
                .await
            {
                self.handle_failure(e);
            } else {
                debug!(id, "Unsubscribed");
            }
        }
        if self.registry.lock().is_empty() {
            debug!("NoSubscriptionsLeft");
            self.reconnect_at = None;
            self.close_connection().await;
        }
    }

    /// Connects the active transport and resubscribes every registration.
    async fn open(&mut self) {
        self.reconnect_at = None;
        self.manager.active_mut().mark_connecting();
        self.publish_state();
        let params = self
            .manager
            .connect_params(self.settings.auth_token.clone());
        let kind = self.manager.active_kind();
        let frames = match self
            .manager
            .active_mut()
            .connect(&params, self.settings.connect_timeout)
            .await
        {
            Ok(frames) => frames,
            Err(e) => {
                warn!(transport = %kind, error = %e, "ConnectFailed");
                self.handle_failure(e);
                return;
            }
        };
        info!(transport = %kind, "PushConnected");
        self.on_open(frames).await;
    }

    async fn on_open(&mut self, frames: FrameStream) {
        self.frames = Some(frames);
        self.manager.record_connected();
        self.subscribed.clear();
        self.start_timers();
        self.publish_state();

        let requests = self.registry.lock().requests();
        for (id, request) in requests {
            if let Err(e) = self
                .manager
                .active_mut()
                .send(&Frame::subscribe(&id, &request))
                .await
            {
                self.handle_failure(e);
                return;
            }
            self.subscribed.insert(id);
        }
        debug!(subscriptions = self.subscribed.len(), "Resubscribed");
    }

    async fn handle_inbound(&mut self, item: Option<Result<Frame, TransportError>>) {
        match item {
            None => self.handle_failure(TransportError::ConnectionClosed),
            Some(Err(e)) if e.is_recoverable() => {
                let message = e.to_string();
                warn!(error = sanitized(&message), "DroppedMalformedFrame");
            }
            Some(Err(e)) => self.handle_failure(e),
            Some(Ok(frame)) => self.handle_frame(frame).await,
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        if let Some(event_id) = frame.event_id.as_deref() {
            if self.manager.observe_event_id(event_id) {
                self.publish_state();
            }
        }
        match frame.frame_type {
            FrameType::Data | FrameType::Error => self.dispatch(frame),
            FrameType::Ping => {
                let pong = Frame::pong(frame.id.as_deref().unwrap_or_default());
                if let Err(e) = self
                    .manager
                    .active_mut()
                    .send(&pong)
                    .await
                {
                    self.handle_failure(e);
                }
            }
            FrameType::Pong => {
                let rtt = self
                    .manager
                    .active_mut()
                    .on_pong(frame.id.as_deref(), Instant::now());
                if rtt.is_some() {
                    self.publish_state();
                }
            }
            FrameType::Subscribe | FrameType::Unsubscribe => {
                debug!(frame_type = %frame.frame_type, "IgnoredClientFrame");
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        let Some(id) = frame.id.as_deref() else {
            trace!("FrameWithoutId");
            return;
        };
        let listeners = self.registry.lock().listeners(id);
        if listeners.is_empty() {
            trace!(id = sanitized(id), "UnknownSubscription");
            return;
        }
        let payload = frame.payload.unwrap_or(Value::Null);
        let event = match frame.frame_type {
            FrameType::Error => SubscriptionEvent::Error(payload),
            _ => SubscriptionEvent::Data(payload),
        };
        notify(&listeners, &event);
    }

    async fn send_heartbeat(&mut self) {
        let Some(ping) = self
            .manager
            .active_mut()
            .heartbeat_ping(Instant::now())
        else {
            return;
        };
        if let Err(e) = self
            .manager
            .active_mut()
            .send(&ping)
            .await
        {
            self.handle_failure(e);
        }
    }

    async fn send_latency_probe(&mut self) {
        let probe = self
            .manager
            .active_mut()
            .latency_ping(Instant::now());
        if let Err(e) = self
            .manager
            .active_mut()
            .send(&probe)
            .await
        {
            self.handle_failure(e);
        }
    }

    fn start_upgrade_attempt(&mut self) {
        if !self.manager.can_upgrade() {
            self.upgrade = None;
            return;
        }
        if self.upgrade_attempt.is_some() {
            trace!("UpgradeAttemptInProgress");
            return;
        }
        let candidates = self.manager.upgrade_candidates();
        let params = self
            .manager
            .connect_params(self.settings.auth_token.clone());
        debug!(candidates = candidates.len(), "UpgradeAttemptStarted");
        self.upgrade_attempt =
            Some(connect_first_candidate(candidates, params, self.settings.connect_timeout).boxed());
    }

    async fn finish_upgrade(&mut self, outcome: Option<(usize, Connection)>) {
        let Some((index, connection)) = outcome else {
            return;
        };
        let Some((switch, frames)) = self
            .manager
            .complete_upgrade(index, connection)
            .await
        else {
            return;
        };
        self.emit(ClientEvent::TransportSwitched(switch));
        self.on_open(frames).await;
    }

    /// Reacts to a lost connection or a failed connect.
    fn handle_failure(&mut self, error: TransportError) {
        self.frames = None;
        self.subscribed.clear();
        self.stop_timers();
        self.manager
            .active_mut()
            .on_failure(error.clone());
        if let Some(switch) = self.manager.record_failure(&error) {
            self.emit(ClientEvent::TransportSwitched(switch));
        }

        if self.registry.lock().is_empty() {
            debug!(error = %error, "ConnectionLostWhileIdle");
            self.publish_state();
            return;
        }
        match self.manager.active_mut().schedule_reconnect() {
            Ok(delay) => {
                debug!(
                    ?delay,
                    attempt = self.manager.active().attempts(),
                    error = %error,
                    "ReconnectScheduled"
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            Err(terminal) => {
                error!(error = %terminal, "ReconnectGivenUp");
                self.terminated = true;
                self.emit(ClientEvent::ConnectionTerminated { error: terminal });
            }
        }
        self.publish_state();
    }

    async fn close_connection(&mut self) {
        self.frames = None;
        self.subscribed.clear();
        self.stop_timers();
        self.manager.active_mut().close().await;
        self.publish_state();
    }

    fn start_timers(&mut self) {
        let now = Instant::now();
        let timer = |period: Option<Duration>| {
            period.map(|period| {
                let mut interval = interval_at(now + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            })
        };
        self.heartbeat = timer(self.settings.heartbeat_interval);
        self.latency = timer(self.settings.latency_interval);
        self.upgrade = if self.manager.can_upgrade() {
            timer(self.settings.upgrade_interval)
        } else {
            None
        };
    }

    fn stop_timers(&mut self) {
        self.heartbeat = None;
        self.latency = None;
        self.upgrade = None;
        self.upgrade_attempt = None;
    }

    fn emit(&self, event: ClientEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn publish_state(&mut self) {
        let active = self.manager.active();
        let state = TransportState {
            status: active.status(),
            reconnect_attempts: active.attempts(),
            latency: active.latency(),
            last_event_id: self
                .manager
                .last_event_id()
                .map(str::to_string),
            error: active.last_error().cloned(),
            active_transport: Some(active.kind()),
        };
        let status = state.status;
        self.state.send_replace(state);
        if status != self.last_status {
            let from = std::mem::replace(&mut self.last_status, status);
            trace!(%from, to = %status, "StatusChanged");
            self.emit(ClientEvent::StatusChanged { from, to: status });
        }
    }
}

async fn next_frame(frames: &mut Option<FrameStream>) -> Option<Result<Frame, TransportError>> {
    match frames {
        Some(stream) => stream.next().await,
        None => future::pending().await,
    }
}

async fn next_upgrade(attempt: &mut Option<UpgradeAttempt>) -> Option<(usize, Connection)> {
    match attempt {
        Some(attempt) => attempt.await,
        None => future::pending().await,
    }
}

async fn maybe_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}
