//! # Transport fallback
//!
//! Keeps one [`ReconnectionController`] per usable transport, ordered best first. Only the
//! active controller holds a connection. Repeated failures move the client one level down
//! the priority list; optional upgrade attempts move it back up once a better transport
//! accepts a connection again.
//!
//! The manager also owns the last event id seen on any transport so that a new connection,
//! whichever transport carries it, resumes delivery where the previous one stopped.
use std::{fmt, sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use tether_common::display::sanitized;

use crate::{
    config::{ClientConfig, ConfigError},
    persistence::EventIdStore,
    reconnect::{connect_with_timeout, ReconnectionController},
    transport::{
        ConnectParams, Connection, FrameStream, Transport, TransportError, TransportKind,
    },
};

/// Key under which the last event id is persisted.
pub const LAST_EVENT_ID_KEY: &str = "tether.last_event_id";

/// Transport kinds usable with `config`, best first.
pub fn detect_priority(config: &ClientConfig) -> Vec<TransportKind> {
    let configured = |kind: &TransportKind| {
        config
            .endpoints
            .for_kind(*kind)
            .is_some()
    };
    if let Some(kind) = config.transport.force {
        return [kind]
            .into_iter()
            .filter(configured)
            .collect();
    }
    let mut priority = Vec::new();
    let candidates = match config.transport.priority.as_deref() {
        Some(custom) => custom.to_vec(),
        None => TransportKind::ALL.to_vec(),
    };
    for kind in candidates {
        if configured(&kind) && !priority.contains(&kind) {
            priority.push(kind);
        }
    }
    priority
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// The active transport failed too often.
    FailureThreshold,
    /// A higher priority transport accepted a connection again.
    Upgrade,
}

impl fmt::Display for SwitchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchReason::FailureThreshold => f.write_str("failure_threshold"),
            SwitchReason::Upgrade => f.write_str("upgrade"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportSwitch {
    pub from: TransportKind,
    pub to: TransportKind,
    pub reason: SwitchReason,
    /// Failure that triggered the switch, if any.
    pub error: Option<TransportError>,
}

pub struct FallbackManager {
    controllers: Vec<ReconnectionController>,
    active: usize,
    failure_count: u32,
    failures_before_switch: u32,
    store: Arc<dyn EventIdStore>,
    last_event_id: Option<String>,
}

impl FallbackManager {
    /// Creates a manager over `transports`, which must already be in priority order.
    pub fn new(
        transports: Vec<Box<dyn Transport>>,
        config: &ClientConfig,
        store: Arc<dyn EventIdStore>,
    ) -> Result<Self, ConfigError> {
        if transports.is_empty() {
            return Err(ConfigError::NoTransport);
        }
        let controllers = transports
            .into_iter()
            .map(|transport| {
                ReconnectionController::new(
                    transport,
                    config.reconnect.clone(),
                    config.heartbeat.timeout,
                )
            })
            .collect();
        let last_event_id = store.get(LAST_EVENT_ID_KEY);
        debug!(last_event_id = ?last_event_id, "LoadedLastEventId");
        Ok(Self {
            controllers,
            active: 0,
            failure_count: 0,
            failures_before_switch: config.transport.failures_before_switch,
            store,
            last_event_id,
        })
    }

    pub fn active(&self) -> &ReconnectionController {
        &self.controllers[self.active]
    }

    pub fn active_mut(&mut self) -> &mut ReconnectionController {
        &mut self.controllers[self.active]
    }

    pub fn active_kind(&self) -> TransportKind {
        self.active().kind()
    }

    pub fn priority(&self) -> Vec<TransportKind> {
        self.controllers
            .iter()
            .map(ReconnectionController::kind)
            .collect()
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Whether a higher priority transport than the active one exists.
    pub fn can_upgrade(&self) -> bool {
        self.active > 0
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn connect_params(&self, auth_token: Option<String>) -> ConnectParams {
        ConnectParams { auth_token, last_event_id: self.last_event_id.clone() }
    }

    pub fn record_connected(&mut self) {
        self.failure_count = 0;
    }

    /// Counts a failure of the active transport. Falls back one level once the count
    /// exceeds the threshold and a lower priority transport exists.
    pub fn record_failure(&mut self, error: &TransportError) -> Option<TransportSwitch> {
        self.failure_count += 1;
        if self.failure_count <= self.failures_before_switch ||
            self.active + 1 >= self.controllers.len()
        {
            return None;
        }
        let from = self.active_kind();
        self.controllers[self.active].reset();
        self.active += 1;
        self.failure_count = 0;
        let to = self.active_kind();
        warn!(%from, %to, error = %error, "TransportFallback");
        Some(TransportSwitch {
            from,
            to,
            reason: SwitchReason::FailureThreshold,
            error: Some(error.clone()),
        })
    }

    /// Records an event id seen on an inbound frame. Returns whether it changed.
    ///
    /// A failing store is logged; the new id is still used for the next handshake.
    pub fn observe_event_id(&mut self, event_id: &str) -> bool {
        if self.last_event_id.as_deref() == Some(event_id) {
            return false;
        }
        self.last_event_id = Some(event_id.to_string());
        if let Err(e) = self
            .store
            .set(LAST_EVENT_ID_KEY, event_id)
        {
            warn!(error = %e, event_id = sanitized(event_id), "PersistEventIdFailed");
        }
        true
    }

    /// Transports above the active one, best first, with their position in the priority
    /// list.
    pub fn upgrade_candidates(&self) -> Vec<(usize, Arc<dyn Transport>)> {
        self.controllers[..self.active]
            .iter()
            .enumerate()
            .map(|(index, controller)| (index, controller.transport()))
            .collect()
    }

    /// Switches to the transport at `index`, which accepted `connection` while the active
    /// one stayed open. The old connection is closed afterwards.
    ///
    /// A candidate that is no longer above the active transport is closed and ignored.
    pub async fn complete_upgrade(
        &mut self,
        index: usize,
        mut connection: Connection,
    ) -> Option<(TransportSwitch, FrameStream)> {
        if index >= self.active {
            debug!(index, active = self.active, "StaleUpgradeDiscarded");
            if let Err(e) = connection.sink.close().await {
                debug!(error = %e, "CloseFailed");
            }
            return None;
        }
        let from = self.active_kind();
        let previous = self.active;
        self.active = index;
        self.failure_count = 0;
        let frames = self.controllers[index].adopt(connection);
        self.controllers[previous].close().await;
        let to = self.active_kind();
        info!(%from, %to, "TransportUpgraded");
        let switch = TransportSwitch { from, to, reason: SwitchReason::Upgrade, error: None };
        Some((switch, frames))
    }
}

/// Connects the first candidate that accepts, best first.
///
/// Owns everything it needs so that it can run next to the live connection.
pub async fn connect_first_candidate(
    candidates: Vec<(usize, Arc<dyn Transport>)>,
    params: ConnectParams,
    connect_timeout: Duration,
) -> Option<(usize, Connection)> {
    for (index, transport) in candidates {
        match connect_with_timeout(transport.as_ref(), &params, connect_timeout).await {
            Ok(connection) => return Some((index, connection)),
            Err(e) => debug!(transport = %transport.kind(), error = %e, "UpgradeAttemptFailed"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::io;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::{
        persistence::{InMemoryEventIdStore, MockEventIdStore, PersistenceError},
        testing::{fake_transport, FakeRemote},
    };

    fn config(failures_before_switch: u32) -> ClientConfig {
        let mut config = ClientConfig::new("http://localhost/graphql");
        config.transport.failures_before_switch = failures_before_switch;
        config
    }

    fn manager(
        kinds: &[TransportKind],
        failures_before_switch: u32,
    ) -> (FallbackManager, Vec<FakeRemote>) {
        let (transports, remotes): (Vec<Box<dyn Transport>>, Vec<_>) = kinds
            .iter()
            .map(|kind| {
                let (transport, remote) = fake_transport(*kind);
                (Box::new(transport) as Box<dyn Transport>, remote)
            })
            .unzip();
        let manager = FallbackManager::new(
            transports,
            &config(failures_before_switch),
            Arc::new(InMemoryEventIdStore::new()),
        )
        .expect("manager");
        (manager, remotes)
    }

    #[rstest]
    #[case::all_configured(None, None, vec![TransportKind::WebSocket, TransportKind::EventStream, TransportKind::Polling])]
    #[case::forced(Some(TransportKind::Polling), None, vec![TransportKind::Polling])]
    #[case::custom_order(
        None,
        Some(vec![TransportKind::Polling, TransportKind::WebSocket]),
        vec![TransportKind::Polling, TransportKind::WebSocket]
    )]
    fn test_detect_priority(
        #[case] force: Option<TransportKind>,
        #[case] priority: Option<Vec<TransportKind>>,
        #[case] expected: Vec<TransportKind>,
    ) {
        let mut config = ClientConfig::new("http://localhost/graphql")
            .with_websocket("ws://localhost/ws")
            .with_event_stream("http://localhost/events")
            .with_polling("http://localhost/poll");
        config.transport.force = force;
        config.transport.priority = priority;

        assert_eq!(detect_priority(&config), expected);
    }

    #[test]
    fn test_detect_priority_skips_missing_endpoints() {
        let mut config = ClientConfig::new("http://localhost/graphql").with_polling("http://x/poll");
        config.transport.priority = Some(vec![TransportKind::WebSocket, TransportKind::Polling]);

        assert_eq!(detect_priority(&config), vec![TransportKind::Polling]);
        assert!(detect_priority(&ClientConfig::new("http://localhost/graphql")).is_empty());
    }

    #[test]
    fn test_new_requires_a_transport() {
        let res =
            FallbackManager::new(Vec::new(), &config(3), Arc::new(InMemoryEventIdStore::new()));

        assert!(matches!(res, Err(ConfigError::NoTransport)));
    }

    #[test]
    fn test_switches_one_level_after_threshold() {
        let (mut manager, _remotes) = manager(&TransportKind::ALL, 2);
        let error = TransportError::ConnectionClosed;

        assert_eq!(manager.record_failure(&error), None);
        assert_eq!(manager.record_failure(&error), None);
        let switch = manager
            .record_failure(&error)
            .expect("third failure exceeds the threshold");

        assert_eq!(
            switch,
            TransportSwitch {
                from: TransportKind::WebSocket,
                to: TransportKind::EventStream,
                reason: SwitchReason::FailureThreshold,
                error: Some(error.clone()),
            }
        );
        assert_eq!(manager.active_kind(), TransportKind::EventStream);
        assert_eq!(manager.failure_count(), 0);
        assert!(manager.can_upgrade());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (mut manager, _remotes) = manager(&TransportKind::ALL, 1);
        let error = TransportError::ConnectionClosed;

        manager.record_failure(&error);
        manager.record_connected();
        assert_eq!(manager.record_failure(&error), None);
        assert_eq!(manager.active_kind(), TransportKind::WebSocket);
    }

    #[test]
    fn test_stays_on_last_transport() {
        let (mut manager, _remotes) = manager(&[TransportKind::Polling], 0);

        for _ in 0..5 {
            assert_eq!(manager.record_failure(&TransportError::ConnectionClosed), None);
        }
        assert_eq!(manager.active_kind(), TransportKind::Polling);
    }

    #[test]
    fn test_event_id_loaded_once_and_persisted() {
        let mut store = MockEventIdStore::new();
        store
            .expect_get()
            .withf(|key| key == LAST_EVENT_ID_KEY)
            .times(1)
            .return_const(Some("41".to_string()));
        store
            .expect_set()
            .withf(|key, value| key == LAST_EVENT_ID_KEY && value == "42")
            .times(1)
            .returning(|_, _| Ok(()));
        let (transport, _) = fake_transport(TransportKind::WebSocket);
        let mut manager =
            FallbackManager::new(vec![Box::new(transport)], &config(3), Arc::new(store)).unwrap();

        assert_eq!(manager.connect_params(None).last_event_id.as_deref(), Some("41"));
        assert!(manager.observe_event_id("42"));
        assert!(!manager.observe_event_id("42"));
        assert_eq!(manager.last_event_id(), Some("42"));
    }

    #[test]
    fn test_event_id_store_failure_is_tolerated() {
        let mut store = MockEventIdStore::new();
        store.expect_get().return_const(None);
        store
            .expect_set()
            .returning(|_, _| Err(PersistenceError::Io(io::Error::other("disk full"))));
        let (transport, _) = fake_transport(TransportKind::WebSocket);
        let mut manager =
            FallbackManager::new(vec![Box::new(transport)], &config(3), Arc::new(store)).unwrap();

        assert!(manager.observe_event_id("7"));
        assert_eq!(manager.connect_params(None).last_event_id.as_deref(), Some("7"));
    }

    async fn polling_fallback() -> (FallbackManager, Vec<FakeRemote>, FrameStream) {
        let (mut manager, remotes) = manager(&[TransportKind::WebSocket, TransportKind::Polling], 0);
        manager.record_failure(&TransportError::ConnectionClosed);
        assert_eq!(manager.active_kind(), TransportKind::Polling);
        let params = manager.connect_params(None);
        let frames = manager
            .active_mut()
            .connect(&params, Duration::from_secs(1))
            .await
            .expect("polling connects");
        (manager, remotes, frames)
    }

    #[tokio::test]
    async fn test_upgrade_only_on_successful_connect() {
        let (mut manager, remotes, _polling_frames) = polling_fallback().await;
        let params = manager.connect_params(None);
        let candidates = manager.upgrade_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].1.kind(), TransportKind::WebSocket);

        remotes[0].set_refuse(true);
        let refused =
            connect_first_candidate(candidates.clone(), params.clone(), Duration::from_secs(1))
                .await;
        assert!(refused.is_none());
        assert_eq!(manager.active_kind(), TransportKind::Polling);
        assert!(manager.active().is_connected());

        remotes[0].set_refuse(false);
        let (index, connection) =
            connect_first_candidate(candidates, params, Duration::from_secs(1))
                .await
                .expect("websocket accepts");
        let (switch, _frames) = manager
            .complete_upgrade(index, connection)
            .await
            .expect("upgrade");

        assert_eq!(switch.from, TransportKind::Polling);
        assert_eq!(switch.to, TransportKind::WebSocket);
        assert_eq!(switch.reason, SwitchReason::Upgrade);
        assert_eq!(manager.active_kind(), TransportKind::WebSocket);
        assert!(manager.active().is_connected());
        assert!(!manager.can_upgrade());
        assert_eq!(remotes[1].closes(), 1);
    }

    #[tokio::test]
    async fn test_stale_upgrade_is_closed() {
        let (mut manager, remotes, _polling_frames) = polling_fallback().await;
        let params = manager.connect_params(None);
        let (index, connection) = connect_first_candidate(
            manager.upgrade_candidates(),
            params,
            Duration::from_secs(1),
        )
        .await
        .expect("websocket accepts");

        let upgraded = manager
            .complete_upgrade(index + 1, connection)
            .await;

        assert!(upgraded.is_none());
        assert_eq!(manager.active_kind(), TransportKind::Polling);
        assert_eq!(remotes[0].closes(), 1);
        assert_eq!(remotes[1].closes(), 0);
    }
}
