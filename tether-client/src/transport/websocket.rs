//! WebSocket transport: frames are JSON text messages in both directions.
use async_trait::async_trait;
use futures03::{stream::SplitSink, SinkExt, StreamExt};
use hyper::{
    header::{
        AUTHORIZATION, CONNECTION, HOST, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE,
        USER_AGENT,
    },
    Uri,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        handshake::client::{generate_key, Request},
        protocol::Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, instrument, trace};

use tether_common::dto::Frame;

use super::{
    ConnectParams, Connection, FrameSink, Transport, TransportError, TransportKind,
};
use crate::rpc::user_agent;

pub(crate) const LAST_EVENT_ID_HEADER: &str = "last-event-id";

type WebSocketSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    uri: Uri,
}

impl WebSocketTransport {
    pub fn new(ws_uri: &str) -> Result<Self, TransportError> {
        let uri = ws_uri
            .parse::<Uri>()
            .map_err(|e| TransportError::UriParsing(ws_uri.to_string(), e.to_string()))?;
        Ok(Self { uri })
    }

    fn handshake(&self, params: &ConnectParams) -> Result<Request, TransportError> {
        let host = self
            .uri
            .authority()
            .ok_or_else(|| {
                TransportError::UriParsing(self.uri.to_string(), "No host found in url".to_string())
            })?
            .as_str();
        let mut request_builder = Request::builder()
            .uri(self.uri.to_string())
            .header(SEC_WEBSOCKET_KEY, generate_key())
            .header(SEC_WEBSOCKET_VERSION, 13)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(HOST, host)
            .header(USER_AGENT, user_agent());

        if let Some(ref token) = params.auth_token {
            request_builder = request_builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(ref event_id) = params.last_event_id {
            request_builder = request_builder.header(LAST_EVENT_ID_HEADER, event_id.as_str());
        }

        request_builder.body(()).map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to build connection request: {e}"))
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    #[instrument(skip_all, fields(uri = %self.uri))]
    async fn connect(&self, params: &ConnectParams) -> Result<Connection, TransportError> {
        let request = self.handshake(params)?;
        let (conn, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        debug!("WebSocketConnected");

        let (sink, stream) = conn.split();
        let frames = stream
            .filter_map(|msg| async move { decode_message(msg) })
            .boxed();
        Ok(Connection { sink: Box::new(WebSocketFrameSink { sink }), frames })
    }
}

/// Maps a raw websocket message to a frame. Control messages are handled by tungstenite and
/// yield nothing.
fn decode_message(
    msg: Result<Message, tungstenite::Error>,
) -> Option<Result<Frame, TransportError>> {
    match msg {
        Ok(Message::Text(text)) => Some(
            Frame::from_json(&text).map_err(|e| TransportError::MalformedFrame(e.to_string())),
        ),
        Ok(Message::Binary(data)) => Some(
            serde_json::from_slice::<Frame>(&data)
                .map_err(|e| TransportError::MalformedFrame(e.to_string())),
        ),
        Ok(Message::Close(_)) => Some(Err(TransportError::ConnectionClosed)),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
            trace!("WebSocketControlMessage");
            None
        }
        Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
            Some(Err(TransportError::ConnectionClosed))
        }
        Err(e) => Some(Err(TransportError::ConnectionError(e.to_string()))),
    }
}

struct WebSocketFrameSink {
    sink: WebSocketSink,
}

#[async_trait]
impl FrameSink for WebSocketFrameSink {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let text = frame
            .to_json()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }
}
