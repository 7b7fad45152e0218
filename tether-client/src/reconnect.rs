//! # Reconnection controller
//!
//! Wraps one transport and tracks the lifecycle of its connection:
//!
//! ```text
//! disconnected -> connecting -> connected
//!      ^               |            |
//!      |            (error)    (close/error)
//!      +---------------+------------+
//! disconnected -> reconnecting -> connecting   (once a reconnect is scheduled)
//! ```
//!
//! The controller computes reconnect delays, counts attempts and keeps the heartbeat and
//! latency probes of the live connection. It never sleeps itself; the push driver owns all
//! timers.
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use rand::Rng;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use tether_common::dto::Frame;

use crate::{
    config::ReconnectConfig,
    transport::{
        ConnectParams, Connection, FrameSink, FrameStream, Transport, TransportError,
        TransportKind,
    },
};

/// Latency probes kept waiting for their pong at most.
const MAX_PENDING_LATENCY_PROBES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Delay before reconnect attempt `attempt` (1-based).
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let base = config
        .initial_delay
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(config.max_delay);
    let jitter = config.jitter_factor;
    if jitter <= 0.0 {
        return base;
    }
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    base.mul_f64(factor)
}

/// Connects `transport`, failing with `ConnectTimeout` once `connect_timeout` elapsed.
pub async fn connect_with_timeout(
    transport: &dyn Transport,
    params: &ConnectParams,
    connect_timeout: Duration,
) -> Result<Connection, TransportError> {
    match timeout(connect_timeout, transport.connect(params)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(TransportError::ConnectTimeout(connect_timeout)),
    }
}

#[derive(Default)]
struct Probes {
    next_seq: u64,
    /// Outstanding heartbeat ping and the instant its pong is due.
    heartbeat: Option<(String, Instant)>,
    /// Outstanding latency pings and the instant they were sent.
    latency: HashMap<String, Instant>,
}

impl Probes {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_seq += 1;
        format!("{prefix}-{}", self.next_seq)
    }

    fn clear(&mut self) {
        self.heartbeat = None;
        self.latency.clear();
    }
}

pub struct ReconnectionController {
    transport: Arc<dyn Transport>,
    sink: Option<Box<dyn FrameSink>>,
    config: ReconnectConfig,
    heartbeat_timeout: Duration,
    status: ConnectionStatus,
    attempts: u32,
    last_error: Option<TransportError>,
    latency: Option<Duration>,
    probes: Probes,
}

impl ReconnectionController {
    pub fn new(
        transport: Box<dyn Transport>,
        config: ReconnectConfig,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            transport: Arc::from(transport),
            sink: None,
            config,
            heartbeat_timeout,
            status: ConnectionStatus::Disconnected,
            attempts: 0,
            last_error: None,
            latency: None,
            probes: Probes::default(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Reconnect attempts scheduled since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    /// Round trip of the most recent latency probe.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn mark_connecting(&mut self) {
        self.status = ConnectionStatus::Connecting;
    }

    /// Shared handle to the transport, for connecting outside the controller.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Opens a connection, bounded by `connect_timeout`. On success the attempt counter is
    /// reset and the inbound frames are handed to the caller.
    pub async fn connect(
        &mut self,
        params: &ConnectParams,
        connect_timeout: Duration,
    ) -> Result<FrameStream, TransportError> {
        self.status = ConnectionStatus::Connecting;
        match connect_with_timeout(self.transport.as_ref(), params, connect_timeout).await {
            Ok(connection) => Ok(self.adopt(connection)),
            Err(e) => {
                self.on_failure(e.clone());
                Err(e)
            }
        }
    }

    /// Takes over a connection opened elsewhere and hands its inbound frames to the caller.
    pub fn adopt(&mut self, connection: Connection) -> FrameStream {
        let Connection { sink, frames } = connection;
        debug!(transport = %self.kind(), attempts = self.attempts, "TransportConnected");
        self.sink = Some(sink);
        self.status = ConnectionStatus::Connected;
        self.attempts = 0;
        self.last_error = None;
        self.probes.clear();
        frames
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        match self.sink.as_mut() {
            Some(sink) => sink.send(frame).await,
            None => Err(TransportError::NotConnected),
        }
    }

    /// Closes the connection on purpose. Not a failure: nothing is recorded.
    pub async fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, transport = %self.kind(), "CloseFailed");
            }
        }
        self.status = ConnectionStatus::Disconnected;
        self.probes.clear();
    }

    /// Records a lost connection.
    pub fn on_failure(&mut self, error: TransportError) {
        self.sink = None;
        self.status = ConnectionStatus::Disconnected;
        self.last_error = Some(error);
        self.probes.clear();
    }

    /// Schedules the next attempt and returns how long to wait before it, or the terminal
    /// error once `max_attempts` attempts were made.
    pub fn schedule_reconnect(&mut self) -> Result<Duration, TransportError> {
        if self.attempts >= self.config.max_attempts {
            let error = TransportError::ReconnectExhausted(self.attempts);
            self.status = ConnectionStatus::Disconnected;
            self.last_error = Some(error.clone());
            return Err(error);
        }
        self.attempts += 1;
        self.status = ConnectionStatus::Reconnecting;
        Ok(backoff_delay(&self.config, self.attempts))
    }

    /// Forgets attempts and errors, e.g. after switching away from this transport.
    pub fn reset(&mut self) {
        self.sink = None;
        self.status = ConnectionStatus::Disconnected;
        self.attempts = 0;
        self.last_error = None;
        self.probes.clear();
    }

    /// Ping frame for the next heartbeat, unless one is still unanswered.
    pub fn heartbeat_ping(&mut self, now: Instant) -> Option<Frame> {
        if self.probes.heartbeat.is_some() {
            return None;
        }
        let id = self.probes.next_id("hb");
        let frame = Frame::ping(&id);
        self.probes.heartbeat = Some((id, now + self.heartbeat_timeout));
        Some(frame)
    }

    /// When the outstanding heartbeat counts as missed.
    pub fn heartbeat_deadline(&self) -> Option<Instant> {
        self.probes
            .heartbeat
            .as_ref()
            .map(|(_, deadline)| *deadline)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub fn latency_ping(&mut self, now: Instant) -> Frame {
        if self.probes.latency.len() >= MAX_PENDING_LATENCY_PROBES {
            self.probes.latency.clear();
        }
        let id = self.probes.next_id("lat");
        let frame = Frame::ping(&id);
        self.probes.latency.insert(id, now);
        frame
    }

    /// Matches a pong to its probe. Returns the round trip when it answers a latency probe.
    pub fn on_pong(&mut self, id: Option<&str>, now: Instant) -> Option<Duration> {
        let id = id?;
        if self
            .probes
            .heartbeat
            .as_ref()
            .is_some_and(|(expected, _)| expected == id)
        {
            trace!(id, "HeartbeatAnswered");
            self.probes.heartbeat = None;
            return None;
        }
        let sent_at = self.probes.latency.remove(id)?;
        let rtt = now.saturating_duration_since(sent_at);
        trace!(id, ?rtt, "LatencySampled");
        self.latency = Some(rtt);
        Some(rtt)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::testing::fake_transport;

    fn config(jitter: f64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_factor: jitter,
            max_attempts,
        }
    }

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(7, 6400)]
    #[case(8, 10_000)]
    #[case(40, 10_000)]
    fn test_backoff_without_jitter(#[case] attempt: u32, #[case] expected_ms: u64) {
        assert_eq!(backoff_delay(&config(0.0, 10), attempt), Duration::from_millis(expected_ms));
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(6)]
    fn test_backoff_jitter_bounds(#[case] attempt: u32) {
        let config = config(0.3, 10);
        let base = 100.0 * 2f64.powi(attempt as i32 - 1);
        let (low, high) = (base * 0.7, base * 1.3);

        for _ in 0..500 {
            let delay = backoff_delay(&config, attempt).as_secs_f64() * 1000.0;
            assert!(delay >= low - 1e-6 && delay <= high + 1e-6, "{delay} outside [{low}, {high}]");
        }
    }

    #[tokio::test]
    async fn test_schedule_until_exhausted() {
        let (transport, _) = fake_transport(TransportKind::WebSocket);
        let mut controller =
            ReconnectionController::new(Box::new(transport), config(0.0, 3), Duration::from_secs(1));

        let delays: Vec<_> = (0..3)
            .map(|_| controller.schedule_reconnect().unwrap())
            .collect();

        assert_eq!(
            delays,
            vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(400)]
        );
        assert_eq!(controller.status(), ConnectionStatus::Reconnecting);
        assert_eq!(controller.schedule_reconnect(), Err(TransportError::ReconnectExhausted(3)));
        assert_eq!(controller.last_error(), Some(&TransportError::ReconnectExhausted(3)));
        assert_eq!(controller.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_resets_attempts() {
        let (transport, remote) = fake_transport(TransportKind::WebSocket);
        let mut controller =
            ReconnectionController::new(Box::new(transport), config(0.0, 5), Duration::from_secs(1));
        remote.set_refuse(true);

        let failed = controller
            .connect(&ConnectParams::default(), Duration::from_secs(1))
            .await;
        assert!(failed.is_err());
        assert_eq!(controller.status(), ConnectionStatus::Disconnected);
        assert!(controller.last_error().is_some());
        controller.schedule_reconnect().unwrap();
        controller.schedule_reconnect().unwrap();

        remote.set_refuse(false);
        let connected = controller
            .connect(&ConnectParams::default(), Duration::from_secs(1))
            .await;

        assert!(connected.is_ok());
        assert!(controller.is_connected());
        assert_eq!(controller.attempts(), 0);
        assert_eq!(controller.last_error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (transport, remote) = fake_transport(TransportKind::Polling);
        remote.set_connect_delay(Duration::from_secs(60));
        let mut controller =
            ReconnectionController::new(Box::new(transport), config(0.0, 5), Duration::from_secs(1));

        let res = controller
            .connect(&ConnectParams::default(), Duration::from_secs(2))
            .await;

        assert_eq!(res.err(), Some(TransportError::ConnectTimeout(Duration::from_secs(2))));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (transport, _) = fake_transport(TransportKind::WebSocket);
        let mut controller =
            ReconnectionController::new(Box::new(transport), config(0.0, 5), Duration::from_secs(1));

        let res = controller.send(&Frame::ping("x")).await;

        assert_eq!(res, Err(TransportError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_and_latency_probes() {
        let (transport, _) = fake_transport(TransportKind::WebSocket);
        let mut controller =
            ReconnectionController::new(Box::new(transport), config(0.0, 5), Duration::from_secs(1));
        let start = Instant::now();

        let ping = controller.heartbeat_ping(start).expect("first heartbeat");
        assert!(controller.heartbeat_ping(start).is_none());
        assert_eq!(controller.heartbeat_deadline(), Some(start + Duration::from_secs(1)));

        assert_eq!(controller.on_pong(ping.id.as_deref(), start), None);
        assert_eq!(controller.heartbeat_deadline(), None);

        let probe = controller.latency_ping(start);
        let rtt = controller.on_pong(probe.id.as_deref(), start + Duration::from_millis(40));
        assert_eq!(rtt, Some(Duration::from_millis(40)));
        assert_eq!(controller.latency(), Some(Duration::from_millis(40)));

        // unknown and repeated pongs are ignored
        assert_eq!(controller.on_pong(probe.id.as_deref(), start), None);
        assert_eq!(controller.on_pong(None, start), None);
    }
}
