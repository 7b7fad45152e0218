//! Polling transport, the last resort when no streaming mechanism gets through.
//!
//! Each poll is a `GET` returning a JSON array of frames queued for this connection since
//! the last poll. The first poll happens during connect so a reachable server is confirmed
//! before the connection counts as open.
use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures03::stream;
use futures03::StreamExt;
use reqwest::{header, Client, Url};
use serde_json::Value;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use tether_common::dto::Frame;

use super::{
    control::{with_connection_id, HttpControlSink},
    ConnectParams, Connection, FrameStream, Transport, TransportError, TransportKind,
};

const LAST_EVENT_ID_PARAM: &str = "last_event_id";

#[derive(Debug, Clone)]
pub struct PollingTransport {
    http: Arc<Client>,
    url: Url,
    interval: Duration,
}

impl PollingTransport {
    pub fn new(
        endpoint: &str,
        http: Arc<Client>,
        interval: Duration,
    ) -> Result<Self, TransportError> {
        let url = endpoint
            .parse::<Url>()
            .map_err(|e| TransportError::UriParsing(endpoint.to_string(), e.to_string()))?;
        Ok(Self { http, url, interval })
    }
}

/// State carried from one poll to the next.
struct Poller {
    http: Arc<Client>,
    url: Url,
    auth_token: Option<String>,
    cursor: Option<String>,
}

impl Poller {
    async fn poll(&mut self) -> Result<Vec<Result<Frame, TransportError>>, TransportError> {
        let mut url = self.url.clone();
        if let Some(cursor) = self.cursor.as_deref() {
            url.query_pairs_mut()
                .append_pair(LAST_EVENT_ID_PARAM, cursor);
        }
        let mut request = self
            .http
            .get(url)
            .header(header::ACCEPT, "application/json");
        if let Some(token) = self.auth_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::ConnectionError(format!("HTTP {}", response.status())));
        }
        let batch: Vec<Value> = response
            .json()
            .await
            .map_err(|e| TransportError::MalformedFrame(e.to_string()))?;
        trace!(frames = batch.len(), "PollReturned");

        let frames: Vec<_> = batch
            .into_iter()
            .map(|raw| {
                serde_json::from_value::<Frame>(raw)
                    .map_err(|e| TransportError::MalformedFrame(e.to_string()))
            })
            .collect();
        if let Some(last) = frames
            .iter()
            .rev()
            .find_map(|f| f.as_ref().ok().and_then(|f| f.event_id.clone()))
        {
            self.cursor = Some(last);
        }
        Ok(frames)
    }
}

fn poll_frames(
    poller: Poller,
    initial: Vec<Result<Frame, TransportError>>,
    interval: Duration,
) -> FrameStream {
    let state = (poller, VecDeque::from(initial), false);
    stream::unfold(state, move |(mut poller, mut ready, failed)| async move {
        if failed {
            return None;
        }
        loop {
            if let Some(item) = ready.pop_front() {
                return Some((item, (poller, ready, false)));
            }
            tokio::time::sleep(interval).await;
            match poller.poll().await {
                Ok(frames) => ready.extend(frames),
                Err(e) => return Some((Err(e), (poller, ready, true))),
            }
        }
    })
    .boxed()
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    #[instrument(skip_all, fields(url = %self.url))]
    async fn connect(&self, params: &ConnectParams) -> Result<Connection, TransportError> {
        let connection_id = Uuid::new_v4();
        let mut poller = Poller {
            http: Arc::clone(&self.http),
            url: with_connection_id(&self.url, &connection_id),
            auth_token: params.auth_token.clone(),
            cursor: params.last_event_id.clone(),
        };
        let initial = poller
            .poll()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        debug!(%connection_id, "PollingConnected");

        let sink = HttpControlSink::new(
            Arc::clone(&self.http),
            &self.url,
            &connection_id,
            params.auth_token.clone(),
        );
        Ok(Connection { sink: Box::new(sink), frames: poll_frames(poller, initial, self.interval) })
    }
}
