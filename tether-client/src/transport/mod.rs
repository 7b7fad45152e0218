//! # Push transports
//!
//! A transport opens one push-capable connection to the server. A connection is split into
//! a [`FrameSink`] for upstream control frames and a [`FrameStream`] of inbound frames. The
//! stream ends (or yields an error) when the connection is lost; the push driver owns the
//! reaction to that.
use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures03::stream::BoxStream;
use reqwest::{header, Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tether_common::dto::Frame;

use crate::{config::ClientConfig, rpc::user_agent};

mod control;
pub mod polling;
pub mod sse;
pub mod websocket;

pub use polling::PollingTransport;
pub use sse::EventStreamTransport;
pub use websocket::WebSocketTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Persistent bidirectional socket.
    #[serde(rename = "websocket")]
    WebSocket,
    /// One-way server-sent event stream, control frames go over HTTP.
    #[serde(rename = "event_stream")]
    EventStream,
    /// Timed polling, control frames go over HTTP.
    #[serde(rename = "polling")]
    Polling,
}

impl TransportKind {
    /// All kinds, best first.
    pub const ALL: [TransportKind; 3] =
        [TransportKind::WebSocket, TransportKind::EventStream, TransportKind::Polling];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::EventStream => "event_stream",
            TransportKind::Polling => "polling",
        }
    }

    pub(crate) fn url_schemes(&self) -> &'static [&'static str] {
        match self {
            TransportKind::WebSocket => &["ws", "wss"],
            TransportKind::EventStream | TransportKind::Polling => &["http", "https"],
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            "event_stream" | "event-stream" | "sse" => Ok(TransportKind::EventStream),
            "polling" | "poll" => Ok(TransportKind::Polling),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Failed to parse URI: {0}. Error: {1}")]
    UriParsing(String, String),

    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("The server closed the connection")]
    ConnectionClosed,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Failed to send frame: {0}")]
    SendFailed(String),

    /// Inbound data that does not decode to a frame. The connection stays usable.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("No pong received within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Not connected")]
    NotConnected,

    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),
}

impl TransportError {
    /// Whether the connection survives this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::MalformedFrame(_))
    }
}

/// Parameters attached to every connection handshake.
#[derive(Clone, Default, PartialEq)]
pub struct ConnectParams {
    pub auth_token: Option<String>,
    /// Last event id seen by this client; servers use it to replay missed frames.
    pub last_event_id: Option<String>,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("last_event_id", &self.last_event_id)
            .finish()
    }
}

/// Inbound frames of one connection.
pub type FrameStream = BoxStream<'static, Result<Frame, TransportError>>;

/// Upstream half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Orderly shutdown of the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub frames: FrameStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn connect(&self, params: &ConnectParams) -> Result<Connection, TransportError>;
}

/// Creates the transport of `kind` for the endpoints in `config`.
pub fn build_transport(
    kind: TransportKind,
    config: &ClientConfig,
) -> Result<Box<dyn Transport>, TransportError> {
    let endpoint = config
        .endpoints
        .for_kind(kind)
        .ok_or_else(|| TransportError::UriParsing(kind.to_string(), "no endpoint".to_string()))?;
    let transport: Box<dyn Transport> = match kind {
        TransportKind::WebSocket => Box::new(WebSocketTransport::new(endpoint)?),
        TransportKind::EventStream => {
            Box::new(EventStreamTransport::new(endpoint, http_client(config)?)?)
        }
        TransportKind::Polling => Box::new(PollingTransport::new(
            endpoint,
            http_client(config)?,
            config.transport.poll_interval,
        )?),
    };
    Ok(transport)
}

fn http_client(config: &ClientConfig) -> Result<Arc<Client>, TransportError> {
    let mut headers = header::HeaderMap::new();
    let user_agent = header::HeaderValue::from_str(&user_agent())
        .map_err(|e| TransportError::ConnectionFailed(format!("Invalid user agent format: {e}")))?;
    headers.insert(header::USER_AGENT, user_agent);
    let client = ClientBuilder::new()
        .default_headers(headers)
        .connect_timeout(config.connect_timeout)
        .build()
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    Ok(Arc::new(client))
}
