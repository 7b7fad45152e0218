//! # Request/response channel
//!
//! Queries and mutations travel over plain HTTP: the operation and its variables are POSTed
//! as JSON and the reply carries `data` and/or `errors`. Transient failures of queries (rate
//! limiting, gateway errors) are retried within a bounded budget, honoring `Retry-After`.
//! Mutations are never retried.
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoffBuilder, ExponentialBackoff};
#[cfg(test)]
use mockall::automock;
use reqwest::{header, Client, ClientBuilder, Response, StatusCode, Url};
use thiserror::Error;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};
use tokio::{
    sync::RwLock,
    time::{sleep, Instant},
};
use tracing::{debug, instrument, trace, warn};

use tether_common::{
    display::{sanitize, sanitized},
    dto::{GraphRequest, GraphResponse, OperationKind},
};

/// Longest response body excerpt kept in an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RPCError {
    /// The passed url failed to parse.
    #[error("Failed to parse URL: {0}. Error: {1}")]
    UrlParsing(String, String),

    /// The request data is not correctly formed.
    #[error("Failed to format request: {0}")]
    FormatRequest(String),

    /// Errors forwarded from the HTTP protocol.
    #[error("Unexpected HTTP client error: {0}")]
    HttpClient(String),

    /// The server answered with a status that carries no graph response.
    #[error("Unexpected HTTP status {0}: {1}")]
    HttpStatus(u16, String),

    /// The response from the server could not be parsed correctly.
    #[error("Failed to parse response: {0}")]
    ParseResponse(String),

    /// The HTTP client gave up waiting for the server.
    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited until {0:?}")]
    RateLimited(Option<SystemTime>),

    #[error("Server unreachable: {0}")]
    ServerUnreachable(String),
}

impl From<reqwest::Error> for RPCError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RPCError::Timeout
        } else {
            RPCError::HttpClient(e.to_string())
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestChannel: Send + Sync {
    /// Executes one query or mutation and returns the server's reply.
    ///
    /// Server reported errors are part of a successful reply; only failures to obtain a
    /// reply at all are returned as `Err`. Implementations must not send a mutation twice.
    async fn execute(
        &self,
        kind: OperationKind,
        request: &GraphRequest,
    ) -> Result<GraphResponse, RPCError>;
}

/// Default time a query may spend waiting between attempts.
const DEFAULT_RETRY_BUDGET: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct HttpGraphClientOptions {
    pub auth_token: Option<String>,
    pub timeout: Option<Duration>,
    /// Upper bound on the time one query spends waiting for rate limits and between
    /// retries of transient failures. Keep it below the caller's own timeout so that
    /// failures surface as errors instead of timeouts.
    pub retry_budget: Duration,
}

impl Default for HttpGraphClientOptions {
    fn default() -> Self {
        Self { auth_token: None, timeout: None, retry_budget: DEFAULT_RETRY_BUDGET }
    }
}

impl HttpGraphClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bearer token sent with every request.
    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_budget(mut self, retry_budget: Duration) -> Self {
        self.retry_budget = retry_budget;
        self
    }
}

/// HTTP request channel.
///
/// Queries hitting a rate limit (429) or a gateway error (502, 503, 504) are retried with
/// exponential backoff for as long as the retry budget allows; the last error is returned
/// once it is spent. Mutations are sent exactly once. A rate limit announced through
/// `Retry-After` is remembered and delays every later request, or fails it right away when
/// the wait would not fit the budget.
#[derive(Debug, Clone)]
pub struct HttpGraphClient {
    http_client: Client,
    url: Url,
    rate_limited_until: Arc<RwLock<Option<SystemTime>>>,
    initial_interval: Duration,
    max_interval: Duration,
    retry_budget: Duration,
}

impl HttpGraphClient {
    pub fn new(endpoint: &str, options: HttpGraphClientOptions) -> Result<Self, RPCError> {
        let url = endpoint
            .parse::<Url>()
            .map_err(|e| RPCError::UrlParsing(endpoint.to_string(), e.to_string()))?;

        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_str(&user_agent())
                .map_err(|e| RPCError::FormatRequest(format!("Invalid user agent format: {e}")))?,
        );
        if let Some(token) = options.auth_token.as_deref() {
            headers.insert(header::AUTHORIZATION, bearer_header(token)?);
        }

        let mut builder = ClientBuilder::new().default_headers(headers);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;
        Ok(Self {
            http_client: client,
            url,
            rate_limited_until: Arc::new(RwLock::new(None)),
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(5),
            retry_budget: options.retry_budget,
        })
    }

    #[cfg(test)]
    pub fn with_test_intervals(mut self) -> Self {
        self.initial_interval = Duration::from_millis(1);
        self.max_interval = Duration::from_millis(5);
        self
    }

    fn backoff_policy(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(2.0)
            .with_max_interval(self.max_interval)
            // the retry budget decides when to stop
            .with_max_elapsed_time(None)
            .build()
    }

    /// Maps rate limiting and gateway statuses to errors, passing everything else on.
    async fn error_for_response(&self, response: Response) -> Result<Response, RPCError> {
        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|h| h.to_str().ok())
                    .and_then(parse_retry_after);
                Err(RPCError::RateLimited(retry_after))
            }
            StatusCode::BAD_GATEWAY |
            StatusCode::SERVICE_UNAVAILABLE |
            StatusCode::GATEWAY_TIMEOUT => {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .map(|body| excerpt(&body))
                    .unwrap_or_default();
                Err(RPCError::ServerUnreachable(format!("{status} {body}").trim_end().to_string()))
            }
            _ => Ok(response),
        }
    }

    async fn send_once(&self, request: &GraphRequest) -> Result<Response, RPCError> {
        let response = self
            .http_client
            .post(self.url.clone())
            .json(request)
            .send()
            .await?;
        self.error_for_response(response)
            .await
    }

    async fn remember_rate_limit(&self, until: SystemTime) {
        let mut guard = self.rate_limited_until.write().await;
        *guard = Some(guard.map_or(until, |current| current.max(until)));
    }

    /// Waits out a remembered rate limit, unless that would overrun the budget.
    async fn wait_for_rate_limit(&self, started: Instant) -> Result<(), RPCError> {
        let until = *self.rate_limited_until.read().await;
        let Some(until) = until else {
            return Ok(());
        };
        let Ok(wait) = until.duration_since(SystemTime::now()) else {
            return Ok(());
        };
        if started.elapsed() + wait > self.retry_budget {
            debug!(?wait, "RateLimitExceedsRetryBudget");
            return Err(RPCError::RateLimited(Some(until)));
        }
        debug!(?wait, "WaitingForRateLimit");
        sleep(wait).await;
        Ok(())
    }

    /// Delay before the next attempt after `error`, or `None` if it is not transient.
    fn retry_delay(error: &RPCError, backoff: &mut ExponentialBackoff) -> Option<Duration> {
        match error {
            RPCError::RateLimited(Some(until)) => until
                .duration_since(SystemTime::now())
                .ok()
                .or_else(|| backoff.next_backoff()),
            RPCError::RateLimited(None) | RPCError::ServerUnreachable(_) => backoff.next_backoff(),
            _ => None,
        }
    }

    async fn post(&self, kind: OperationKind, request: &GraphRequest) -> Result<Response, RPCError> {
        let started = Instant::now();
        let mut backoff = self.backoff_policy();
        loop {
            self.wait_for_rate_limit(started)
                .await?;
            let error = match self.send_once(request).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            if let RPCError::RateLimited(Some(until)) = &error {
                self.remember_rate_limit(*until)
                    .await;
            }
            if kind == OperationKind::Mutation {
                debug!(error = %error, "MutationNotRetried");
                return Err(error);
            }
            let Some(delay) = Self::retry_delay(&error, &mut backoff) else {
                return Err(error);
            };
            if started.elapsed() + delay > self.retry_budget {
                debug!(?delay, error = %error, "RetryBudgetExhausted");
                return Err(error);
            }
            warn!(?delay, error = %error, "RetryingQuery");
            sleep(delay).await;
        }
    }
}

#[async_trait]
impl RequestChannel for HttpGraphClient {
    #[instrument(skip(self, request), fields(url = %self.url))]
    async fn execute(
        &self,
        kind: OperationKind,
        request: &GraphRequest,
    ) -> Result<GraphResponse, RPCError> {
        trace!(operation = sanitized(&request.query), "SendingRequest");
        let response = self.post(kind, request).await?;
        let status = response.status();
        let body = response.text().await?;

        match serde_json::from_str::<GraphResponse>(&body) {
            // graph servers may answer client errors with a regular error response
            Ok(parsed) if status.is_success() || !parsed.errors.is_empty() => {
                trace!(%status, errors = parsed.errors.len(), "ReceivedResponse");
                Ok(parsed)
            }
            Ok(_) => Err(RPCError::HttpStatus(status.as_u16(), excerpt(&body))),
            Err(_) if !status.is_success() => {
                Err(RPCError::HttpStatus(status.as_u16(), excerpt(&body)))
            }
            Err(err) => {
                Err(RPCError::ParseResponse(format!("Error: {err}, Body: {}", excerpt(&body))))
            }
        }
    }
}

pub(crate) fn user_agent() -> String {
    format!("tether-client-{version}", version = env!("CARGO_PKG_VERSION"))
}

fn bearer_header(token: &str) -> Result<header::HeaderValue, RPCError> {
    let mut value = header::HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| RPCError::FormatRequest(format!("Invalid authorization token format: {e}")))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Sanitized, bounded excerpt of a response body for error messages.
fn excerpt(body: &str) -> String {
    let clean = sanitize(body);
    match clean.char_indices().nth(MAX_ERROR_BODY) {
        Some((cut, _)) => format!("{}...", &clean[..cut]),
        None => clean.into_owned(),
    }
}

/// Reads a `Retry-After` value, either delay seconds or an HTTP date.
fn parse_retry_after(val: &str) -> Option<SystemTime> {
    let val = val.trim();
    match val.parse::<u64>() {
        Ok(secs) => Some(SystemTime::now() + Duration::from_secs(secs)),
        Err(_) => OffsetDateTime::parse(val, &Rfc2822)
            .ok()
            .map(SystemTime::from),
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn client(url: &str, token: Option<&str>) -> HttpGraphClient {
        HttpGraphClient::new(
            url,
            HttpGraphClientOptions::new()
                .with_auth_token(token.map(str::to_string))
                .with_retry_budget(Duration::from_millis(200)),
        )
        .expect("create client")
        .with_test_intervals()
    }

    fn request(query: &str) -> GraphRequest {
        GraphRequest::new(query, json!({}))
    }

    #[tokio::test]
    async fn test_execute_posts_operation() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/graphql")
            .match_header("authorization", "Bearer secret")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({"query": "{ me { id } }", "variables": {"a": 1}})))
            .with_body(r#"{"data":{"me":{"id":"1"}}}"#)
            .expect(1)
            .create_async()
            .await;

        let response = client(&format!("{}/graphql", server.url()), Some("secret"))
            .execute(OperationKind::Query, &GraphRequest::new("{ me { id } }", json!({"a": 1})))
            .await
            .expect("execute");

        mock.assert();
        assert_eq!(response, GraphResponse::from_data(json!({"me": {"id": "1"}})));
    }

    #[tokio::test]
    async fn test_execute_passes_server_errors_through() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(400)
            .with_body(r#"{"errors":[{"message":"Cannot query field \"nope\""}]}"#)
            .create_async()
            .await;

        let response = client(&server.url(), None)
            .execute(OperationKind::Query, &request("{ nope }"))
            .await
            .expect("execute");

        mock.assert();
        assert_eq!(response.data, None);
        assert_eq!(response.errors[0].message, "Cannot query field \"nope\"");
    }

    #[tokio::test]
    async fn test_query_retried_after_unavailable_server() {
        let mut server = Server::new_async().await;
        let unavailable = server
            .mock("POST", "/")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/")
            .with_body(r#"{"data":{"ok":true}}"#)
            .expect(1)
            .create_async()
            .await;

        let response = client(&server.url(), None)
            .execute(OperationKind::Query, &request("{ ok }"))
            .await
            .expect("execute");

        unavailable.assert();
        ok.assert();
        assert_eq!(response.data, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_mutation_sent_exactly_once_on_gateway_timeout() {
        let mut server = Server::new_async().await;
        let gateway_timeout = server
            .mock("POST", "/")
            .with_status(504)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/")
            .with_body(r#"{"data":{"paid":true}}"#)
            .expect(0)
            .create_async()
            .await;

        let res = client(&server.url(), None)
            .execute(OperationKind::Mutation, &request("mutation { pay }"))
            .await;

        gateway_timeout.assert();
        ok.assert();
        assert!(matches!(res, Err(RPCError::ServerUnreachable(msg)) if msg.starts_with("504")));
    }

    #[tokio::test]
    async fn test_query_gives_up_once_retry_budget_is_spent() {
        let mut server = Server::new_async().await;
        let unavailable = server
            .mock("POST", "/")
            .with_status(503)
            .expect_at_least(2)
            .create_async()
            .await;
        let started = std::time::Instant::now();

        let res = client(&server.url(), None)
            .execute(OperationKind::Query, &request("{ ok }"))
            .await;

        unavailable.assert();
        assert!(matches!(res, Err(RPCError::ServerUnreachable(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_rate_limit_beyond_budget_fails_fast_and_is_remembered() {
        let mut server = Server::new_async().await;
        let limited = server
            .mock("POST", "/")
            .with_status(429)
            .with_header("Retry-After", "60")
            .expect(1)
            .create_async()
            .await;
        let http_client = client(&server.url(), None);

        let first = http_client
            .execute(OperationKind::Query, &request("{ ok }"))
            .await;
        let second = http_client
            .execute(OperationKind::Query, &request("{ other }"))
            .await;

        limited.assert();
        assert!(matches!(first, Err(RPCError::RateLimited(Some(_)))));
        assert!(matches!(second, Err(RPCError::RateLimited(Some(_)))));
    }

    #[tokio::test]
    async fn test_execute_rejects_unparsable_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_body("<html>\u{1b}[31mnot json</html>")
            .create_async()
            .await;

        let res = client(&server.url(), None)
            .execute(OperationKind::Query, &request("{ ok }"))
            .await;

        match res {
            Err(RPCError::ParseResponse(msg)) => assert!(!msg.contains('\u{1b}')),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_reports_unexpected_status() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(401)
            .with_body("unauthorized")
            .expect(1)
            .create_async()
            .await;

        let res = client(&server.url(), None)
            .execute(OperationKind::Query, &request("{ ok }"))
            .await;

        mock.assert();
        assert_eq!(res, Err(RPCError::HttpStatus(401, "unauthorized".to_string())));
    }

    #[test]
    fn test_invalid_url() {
        let res = HttpGraphClient::new("not a url", HttpGraphClientOptions::default());

        assert!(matches!(res, Err(RPCError::UrlParsing(_, _))));
    }

    #[rstest]
    #[case::seconds(" 60 ", true)]
    #[case::http_date("Sat, 01 Jan 2050 12:00:00 +0000", true)]
    #[case::garbage("soon", false)]
    #[case::empty("", false)]
    #[case::bad_date("Mon, 32 Jan 2030 25:00:00 +0000", false)]
    fn test_parse_retry_after(#[case] raw: &str, #[case] in_future: bool) {
        let parsed = parse_retry_after(raw);

        assert_eq!(parsed.is_some(), in_future);
        if let Some(until) = parsed {
            assert!(until > SystemTime::now());
        }
    }

    #[test]
    fn test_retry_delay_only_for_transient_errors() {
        let http_client = client("http://localhost:8080", None);
        let mut backoff = http_client.backoff_policy();
        let until = SystemTime::now() + Duration::from_secs(30);

        let limited = HttpGraphClient::retry_delay(&RPCError::RateLimited(Some(until)), &mut backoff)
            .expect("rate limits are transient");

        assert!(limited > Duration::from_secs(29));
        assert!(HttpGraphClient::retry_delay(
            &RPCError::ServerUnreachable("503".into()),
            &mut backoff
        )
        .is_some());
        assert_eq!(
            HttpGraphClient::retry_delay(&RPCError::HttpStatus(401, String::new()), &mut backoff),
            None
        );
        assert_eq!(HttpGraphClient::retry_delay(&RPCError::Timeout, &mut backoff), None);
    }
}
