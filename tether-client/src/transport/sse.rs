//! Server-sent event transport.
//!
//! The downstream is a `text/event-stream` response: every event's `data` is one JSON frame
//! and its `id` is the frame's event id. Upstream control frames are POSTed to the same
//! endpoint, tagged with the connection id the stream was opened with.
use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures03::{stream, Stream, StreamExt};
use reqwest::{header, Client, Url};
use tracing::{debug, instrument};
use uuid::Uuid;

use tether_common::dto::Frame;

use super::{
    control::{with_connection_id, HttpControlSink},
    ConnectParams, Connection, FrameStream, Transport, TransportError, TransportKind,
};

pub(crate) const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Events larger than this are discarded.
const MAX_EVENT_BYTES: usize = 1 << 20;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser.
///
/// Bytes may arrive split anywhere, including inside a line or a multi-byte character.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
    event_type: Option<String>,
    data_lines: Vec<String>,
    data_len: usize,
    event_id: Option<String>,
    oversized: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns the events it completed. An oversized event is reported as
    /// an error in place of the event.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<SseEvent, TransportError>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self
            .buffer
            .iter()
            .position(|b| *b == b'\n')
        {
            let mut line = self.buffer.split_to(pos);
            self.buffer.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
            } else {
                self.process_line(&String::from_utf8_lossy(&line));
            }
        }
        if self.buffer.len() > MAX_EVENT_BYTES {
            self.buffer.clear();
            self.oversized = true;
        }
        events
    }

    fn process_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => {
                self.data_len += value.len();
                if self.data_len > MAX_EVENT_BYTES {
                    self.oversized = true;
                } else {
                    self.data_lines.push(value.to_string());
                }
            }
            "id" if !value.contains('\0') => self.event_id = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<Result<SseEvent, TransportError>> {
        let event_type = self.event_type.take();
        let data_lines = std::mem::take(&mut self.data_lines);
        self.data_len = 0;
        if std::mem::take(&mut self.oversized) {
            return Some(Err(TransportError::MalformedFrame(format!(
                "event exceeds {MAX_EVENT_BYTES} bytes"
            ))));
        }
        if data_lines.is_empty() {
            return None;
        }
        Some(Ok(SseEvent { event: event_type, data: data_lines.join("\n"), id: self.event_id.clone() }))
    }
}

fn event_to_frame(event: SseEvent) -> Result<Frame, TransportError> {
    let mut frame =
        Frame::from_json(&event.data).map_err(|e| TransportError::MalformedFrame(e.to_string()))?;
    if frame.event_id.is_none() {
        frame.event_id = event.id;
    }
    Ok(frame)
}

/// Turns a byte stream into frames. The frame stream ends when the byte stream does.
pub(crate) fn event_frames<S>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = (bytes.boxed(), SseParser::new(), VecDeque::new());
    stream::unfold(state, |(mut bytes, mut parser, mut ready)| async move {
        loop {
            if let Some(item) = ready.pop_front() {
                return Some((item, (bytes, parser, ready)));
            }
            match bytes.next().await {
                Some(Ok(chunk)) => ready.extend(
                    parser
                        .feed(&chunk)
                        .into_iter()
                        .map(|event| event.and_then(event_to_frame)),
                ),
                Some(Err(e)) => {
                    let error = TransportError::ConnectionError(e.to_string());
                    return Some((Err(error), (bytes, parser, ready)));
                }
                None => return None,
            }
        }
    })
    .boxed()
}

#[derive(Debug, Clone)]
pub struct EventStreamTransport {
    http: Arc<Client>,
    url: Url,
}

impl EventStreamTransport {
    pub fn new(endpoint: &str, http: Arc<Client>) -> Result<Self, TransportError> {
        let url = endpoint
            .parse::<Url>()
            .map_err(|e| TransportError::UriParsing(endpoint.to_string(), e.to_string()))?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl Transport for EventStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::EventStream
    }

    #[instrument(skip_all, fields(url = %self.url))]
    async fn connect(&self, params: &ConnectParams) -> Result<Connection, TransportError> {
        let connection_id = Uuid::new_v4();
        let mut request = self
            .http
            .get(with_connection_id(&self.url, &connection_id))
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache");
        if let Some(token) = params.auth_token.as_deref() {
            request = request.bearer_auth(token);
        }
        if let Some(event_id) = params.last_event_id.as_deref() {
            request = request.header(LAST_EVENT_ID_HEADER, event_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::ConnectionFailed(format!("HTTP {}", response.status())));
        }
        debug!(%connection_id, "EventStreamConnected");

        let sink = HttpControlSink::new(
            Arc::clone(&self.http),
            &self.url,
            &connection_id,
            params.auth_token.clone(),
        );
        Ok(Connection { sink: Box::new(sink), frames: event_frames(response.bytes_stream()) })
    }
}
