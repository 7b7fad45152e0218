//! Client configuration.
//!
//! Every option has a default; a configuration only needs the HTTP endpoint of the graph API
//! plus whichever push endpoints the server offers. Configurations can be built in code or
//! loaded from YAML, where durations are given in milliseconds (`request_timeout_ms: 5000`).
use std::{fmt, fs, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::transport::TransportKind;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 1000;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LATENCY_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_JITTER_FACTOR: f64 = 0.3;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_FAILURES_BEFORE_SWITCH: u32 = 3;
pub const DEFAULT_UPGRADE_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse URL: {0}. Error: {1}")]
    UrlParsing(String, String),

    /// Raised when a push operation is requested but no push endpoint is usable.
    #[error("No push transport is configured")]
    NoTransport,

    #[error("Failed to read config file {0}: {1}")]
    Io(String, String),

    #[error("Failed to parse config file {0}: {1}")]
    Parse(String, String),
}

/// Serializes a `Duration` as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// Request/response endpoint, e.g. `https://api.example.com/graphql`.
    pub http: String,
    pub websocket: Option<String>,
    pub event_stream: Option<String>,
    pub polling: Option<String>,
}

impl Endpoints {
    pub fn for_kind(&self, kind: TransportKind) -> Option<&str> {
        match kind {
            TransportKind::WebSocket => self.websocket.as_deref(),
            TransportKind::EventStream => self.event_stream.as_deref(),
            TransportKind::Polling => self.polling.as_deref(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true, ttl: DEFAULT_CACHE_TTL, max_entries: DEFAULT_CACHE_MAX_ENTRIES }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    /// How long to wait for the pong answering a heartbeat ping.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub enabled: bool,
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self { enabled: false, interval: DEFAULT_LATENCY_INTERVAL }
    }
}

/// Backoff applied between reconnection attempts of one transport.
///
/// The delay before attempt `k` (1-based) is `min(max_delay, initial_delay * 2^(k-1))`
/// scaled by a uniform factor in `[1 - jitter_factor, 1 + jitter_factor]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_RECONNECT_INITIAL_DELAY,
            max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Use only this transport, ignoring the priority order.
    pub force: Option<TransportKind>,
    /// Replaces the default order `websocket, event_stream, polling`.
    pub priority: Option<Vec<TransportKind>>,
    /// Consecutive failures tolerated before falling back one level.
    pub failures_before_switch: u32,
    pub enable_upgrade_attempts: bool,
    #[serde(rename = "upgrade_attempt_interval_ms", with = "duration_ms")]
    pub upgrade_attempt_interval: Duration,
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            force: None,
            priority: None,
            failures_before_switch: DEFAULT_FAILURES_BEFORE_SWITCH,
            enable_upgrade_attempts: false,
            upgrade_attempt_interval: DEFAULT_UPGRADE_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoints: Endpoints,
    /// Sent as `Authorization: Bearer <token>` on every channel.
    pub auth_token: Option<String>,
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    pub dedup_enabled: bool,
    pub cache: CacheConfig,
    pub heartbeat: HeartbeatConfig,
    pub latency: LatencyConfig,
    pub reconnect: ReconnectConfig,
    pub transport: TransportConfig,
    /// Capacity of the channel behind `DataClient::subscribe_stream`.
    pub subscription_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            auth_token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dedup_enabled: true,
            cache: CacheConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            latency: LatencyConfig::default(),
            reconnect: ReconnectConfig::default(),
            transport: TransportConfig::default(),
            subscription_buffer_size: DEFAULT_SUBSCRIPTION_BUFFER,
        }
    }
}

// Hand written so the bearer token never ends up in a log line.
impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoints", &self.endpoints)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("dedup_enabled", &self.dedup_enabled)
            .field("cache", &self.cache)
            .field("heartbeat", &self.heartbeat)
            .field("latency", &self.latency)
            .field("reconnect", &self.reconnect)
            .field("transport", &self.transport)
            .field("subscription_buffer_size", &self.subscription_buffer_size)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(http_endpoint: &str) -> Self {
        Self {
            endpoints: Endpoints { http: http_endpoint.to_string(), ..Default::default() },
            ..Default::default()
        }
    }

    pub fn with_websocket(mut self, url: &str) -> Self {
        self.endpoints.websocket = Some(url.to_string());
        self
    }

    pub fn with_event_stream(mut self, url: &str) -> Self {
        self.endpoints.event_stream = Some(url.to_string());
        self
    }

    pub fn with_polling(mut self, url: &str) -> Self {
        self.endpoints.polling = Some(url.to_string());
        self
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache.ttl = ttl;
        self
    }

    /// Loads and validates a YAML configuration file.
    pub fn from_yaml(path: &str) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_string(), e.to_string()))?;
        let config: ClientConfig = serde_yaml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(path.to_string(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url(&self.endpoints.http, &["http", "https"])?;
        for kind in TransportKind::ALL {
            if let Some(url) = self.endpoints.for_kind(kind) {
                check_url(url, kind.url_schemes())?;
            }
        }
        if let Some(kind) = self.transport.force {
            if self.endpoints.for_kind(kind).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "transport {kind} is forced but has no endpoint"
                )));
            }
        }

        positive("request_timeout", self.request_timeout)?;
        positive("connect_timeout", self.connect_timeout)?;
        if self.cache.enabled {
            positive("cache.ttl", self.cache.ttl)?;
            if self.cache.max_entries == 0 {
                return Err(ConfigError::Invalid("cache.max_entries must be positive".into()));
            }
        }
        if self.heartbeat.enabled {
            positive("heartbeat.interval", self.heartbeat.interval)?;
            positive("heartbeat.timeout", self.heartbeat.timeout)?;
        }
        if self.latency.enabled {
            positive("latency.interval", self.latency.interval)?;
        }

        let reconnect = &self.reconnect;
        positive("reconnect.initial_delay", reconnect.initial_delay)?;
        if reconnect.initial_delay > reconnect.max_delay {
            return Err(ConfigError::Invalid(
                "reconnect.initial_delay must not exceed reconnect.max_delay".into(),
            ));
        }
        if !(0.0..1.0).contains(&reconnect.jitter_factor) {
            return Err(ConfigError::Invalid(format!(
                "reconnect.jitter_factor must be in [0, 1), got {}",
                reconnect.jitter_factor
            )));
        }

        if self.transport.enable_upgrade_attempts {
            positive("transport.upgrade_attempt_interval", self.transport.upgrade_attempt_interval)?;
        }
        positive("transport.poll_interval", self.transport.poll_interval)?;
        if self.subscription_buffer_size == 0 {
            return Err(ConfigError::Invalid("subscription_buffer_size must be positive".into()));
        }
        Ok(())
    }
}

fn positive(name: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid(format!("{name} must be positive")));
    }
    Ok(())
}

fn check_url(raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = raw
        .parse::<Url>()
        .map_err(|e| ConfigError::UrlParsing(raw.to_string(), e.to_string()))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::UrlParsing(
            raw.to_string(),
            format!("expected scheme {}", schemes.join(" or ")),
        ));
    }
    Ok(())
}
