//! Upstream channel for transports whose downstream is one-way.
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::trace;
use uuid::Uuid;

use tether_common::dto::Frame;

use super::{FrameSink, TransportError};

pub(super) const CONNECTION_ID_PARAM: &str = "connection_id";

/// Copy of `url` tagged with the connection id, so the server can route control frames
/// to the right downstream.
pub(super) fn with_connection_id(url: &Url, connection_id: &Uuid) -> Url {
    let mut url = url.clone();
    url.query_pairs_mut()
        .append_pair(CONNECTION_ID_PARAM, &connection_id.to_string());
    url
}

/// POSTs control frames to the transport endpoint.
pub(super) struct HttpControlSink {
    http: Arc<Client>,
    url: Url,
    auth_token: Option<String>,
    closed: bool,
}

impl HttpControlSink {
    pub(super) fn new(
        http: Arc<Client>,
        endpoint: &Url,
        connection_id: &Uuid,
        auth_token: Option<String>,
    ) -> Self {
        Self { http, url: with_connection_id(endpoint, connection_id), auth_token, closed: false }
    }
}

#[async_trait]
impl FrameSink for HttpControlSink {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        let mut request = self.http.post(self.url.clone()).json(frame);
        if let Some(token) = self.auth_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::SendFailed(format!("HTTP {}", response.status())));
        }
        trace!(frame_type = %frame.frame_type, "ControlFrameSent");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}
