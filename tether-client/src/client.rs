//! # Data Client
//!
//! Public entry point for applications. Queries are served from the response cache when
//! possible and otherwise collapsed with identical in-flight queries before they reach the
//! request channel. Mutations skip the cache but are still collapsed. Subscriptions are
//! multiplexed over one push connection run by a background driver task, see
//! [`crate::connection`].
//!
//! ```no_run
//! # use serde_json::json;
//! # use tether_client::{client::DataClient, config::ClientConfig};
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new("https://api.example.com/graphql")
//!     .with_websocket("wss://api.example.com/ws");
//! let client = DataClient::new(config)?;
//!
//! let user = client
//!     .query("query($id: ID!) { user(id: $id) { name } }", json!({"id": 1}))
//!     .await?;
//! let handle = client.subscribe("subscription { price }", json!({}), |event| {
//!     println!("{event:?}");
//! })?;
//! # drop(handle);
//! # Ok(())
//! # }
//! ```
use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{broadcast, mpsc, mpsc::error::TrySendError, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, instrument, trace, warn};

use tether_common::{
    display::sanitized,
    dto::{GraphError, GraphRequest, OperationKind},
    keys::{operation_key, subscription_id},
};

use crate::{
    cache::{CacheMatcher, CacheStats, ResponseCache},
    config::{ClientConfig, ConfigError},
    connection::{
        ClientEvent, Command, DriverSettings, PushDriver, TransportState, EVENT_CHANNEL_CAPACITY,
    },
    dedup::{DedupStats, Deduplicator},
    fallback::{detect_priority, FallbackManager},
    persistence::{EventIdStore, InMemoryEventIdStore},
    rpc::{HttpGraphClient, HttpGraphClientOptions, RPCError, RequestChannel},
    subscriptions::{Registry, SubscriptionEvent, SubscriptionHandle},
    transport::{build_transport, Transport},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// The operation was rejected before anything was sent.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The server processed the operation and reported errors.
    #[error("Server returned errors: {}", join_messages(.0))]
    Server(Vec<GraphError>),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// No reply could be obtained from the request channel.
    #[error("Request failed: {0}")]
    Request(RPCError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Client is closed")]
    Closed,
}

fn join_messages(errors: &[GraphError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

fn validate(operation: &str, variables: &Value) -> Result<(), ClientError> {
    if operation.trim().is_empty() {
        return Err(ClientError::Validation("operation must not be empty".to_string()));
    }
    if !(variables.is_object() || variables.is_null()) {
        return Err(ClientError::Validation("variables must be a JSON object".to_string()));
    }
    Ok(())
}

struct PushHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<TransportState>,
    events: broadcast::Sender<ClientEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: ClientConfig,
    channel: Arc<dyn RequestChannel>,
    cache: Option<Mutex<ResponseCache>>,
    dedup: Deduplicator<Value, ClientError>,
    registry: Arc<Mutex<Registry>>,
    push: Option<PushHandle>,
}

impl Inner {
    async fn fetch(
        &self,
        kind: OperationKind,
        request: &GraphRequest,
    ) -> Result<Value, ClientError> {
        trace!(?kind, operation = sanitized(&request.query), "FetchingOperation");
        let response = self
            .channel
            .execute(kind, request)
            .await
            .map_err(|e| match e {
                RPCError::Timeout => ClientError::Timeout(self.config.request_timeout),
                other => ClientError::Request(other),
            })?;
        if !response.errors.is_empty() {
            debug!(errors = response.errors.len(), "ServerReportedErrors");
            return Err(ClientError::Server(response.errors));
        }
        response.data.ok_or_else(|| {
            ClientError::Request(RPCError::ParseResponse(
                "response carries neither data nor errors".to_string(),
            ))
        })
    }

    fn push(&self) -> Result<&PushHandle, ClientError> {
        self.push
            .as_ref()
            .ok_or(ClientError::Config(ConfigError::NoTransport))
    }
}

/// Cloneable handle to one client instance. Clones share cache, in-flight operations,
/// subscriptions and the push connection.
#[derive(Clone)]
pub struct DataClient {
    inner: Arc<Inner>,
}

pub struct DataClientBuilder {
    config: ClientConfig,
    channel: Option<Arc<dyn RequestChannel>>,
    transports: Option<Vec<Box<dyn Transport>>>,
    store: Option<Arc<dyn EventIdStore>>,
}

impl DataClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self { config, channel: None, transports: None, store: None }
    }

    /// Replaces the HTTP channel built from the configured endpoint.
    pub fn request_channel(mut self, channel: Arc<dyn RequestChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Replaces the transports built from the configured endpoints. They are used in the
    /// given order, best first.
    pub fn transports(mut self, transports: Vec<Box<dyn Transport>>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Durable store for the last event id. Defaults to an in-memory store.
    pub fn event_id_store(mut self, store: Arc<dyn EventIdStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds the client. When push transports are available the push driver is spawned on
    /// the current tokio runtime; it stays idle until the first subscription.
    pub fn build(self) -> Result<DataClient, ClientError> {
        let config = self.config;
        config.validate()?;

        let channel = match self.channel {
            Some(channel) => channel,
            None => {
                let options = HttpGraphClientOptions::new()
                    .with_auth_token(config.auth_token.clone())
                    .with_timeout(Some(config.request_timeout))
                    .with_retry_budget(config.request_timeout / 2);
                Arc::new(
                    HttpGraphClient::new(&config.endpoints.http, options)
                        .map_err(ClientError::Request)?,
                )
            }
        };
        let cache = if config.cache.enabled {
            let cache = ResponseCache::new(config.cache.max_entries)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            Some(Mutex::new(cache))
        } else {
            None
        };
        let transports = match self.transports {
            Some(transports) => transports,
            None => detect_priority(&config)
                .into_iter()
                .map(|kind| build_transport(kind, &config))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?,
        };

        let registry = Arc::new(Mutex::new(Registry::default()));
        let push = if transports.is_empty() {
            debug!("NoPushTransport");
            None
        } else {
            let runtime = Handle::try_current().map_err(|_| {
                ConfigError::Invalid("the client must be built inside a tokio runtime".into())
            })?;
            let store = self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryEventIdStore::new()));
            let manager = FallbackManager::new(transports, &config, store)?;
            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            let (driver, state) = PushDriver::new(
                manager,
                Arc::clone(&registry),
                commands_rx,
                events_tx.clone(),
                DriverSettings::from_config(&config),
            );
            let task = runtime.spawn(driver.run());
            Some(PushHandle {
                commands: commands_tx,
                state,
                events: events_tx,
                task: Mutex::new(Some(task)),
            })
        };

        Ok(DataClient {
            inner: Arc::new(Inner {
                dedup: Deduplicator::new(),
                config,
                channel,
                cache,
                registry,
                push,
            }),
        })
    }
}

impl DataClient {
    /// Builds a client with the HTTP channel and transports described by `config`.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        DataClientBuilder::new(config).build()
    }

    pub fn builder(config: ClientConfig) -> DataClientBuilder {
        DataClientBuilder::new(config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Runs a query. Unexpired cached results are returned without touching the network;
    /// otherwise the result is fetched, shared with identical concurrent queries and cached.
    #[instrument(skip(self, variables))]
    pub async fn query(&self, operation: &str, variables: Value) -> Result<Value, ClientError> {
        validate(operation, &variables)?;
        let key = operation_key(OperationKind::Query, operation, &variables);
        if let Some(cache) = self.inner.cache.as_ref() {
            if let Some(hit) = cache.lock().get(&key) {
                return Ok(hit);
            }
        }

        let inner = Arc::clone(&self.inner);
        let request = GraphRequest::new(operation, variables);
        let cache_key = key.clone();
        self.run(&key, move || async move {
            let data = inner
                .fetch(OperationKind::Query, &request)
                .await?;
            if let Some(cache) = inner.cache.as_ref() {
                cache
                    .lock()
                    .set(cache_key, data.clone(), inner.config.cache.ttl);
            }
            Ok(data)
        })
        .await
    }

    /// Runs a mutation. Results are never cached; identical concurrent mutations share one
    /// execution.
    #[instrument(skip(self, variables))]
    pub async fn mutate(&self, operation: &str, variables: Value) -> Result<Value, ClientError> {
        validate(operation, &variables)?;
        let key = operation_key(OperationKind::Mutation, operation, &variables);
        let inner = Arc::clone(&self.inner);
        let request = GraphRequest::new(operation, variables);
        self.run(&key, move || async move {
            inner
                .fetch(OperationKind::Mutation, &request)
                .await
        })
        .await
    }

    async fn run<F, Fut>(&self, key: &str, operation: F) -> Result<Value, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ClientError>> + Send + 'static,
    {
        let limit = self.inner.config.request_timeout;
        let execution = async {
            if self.inner.config.dedup_enabled {
                self.inner
                    .dedup
                    .execute(key, operation)
                    .await
            } else {
                operation().await
            }
        };
        match timeout(limit, execution).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(?limit, "RequestTimedOut");
                Err(ClientError::Timeout(limit))
            }
        }
    }

    /// Attaches `callback` to the subscription identified by `operation` and `variables`.
    ///
    /// Identical subscriptions share one wire subscription. The callback runs on the push
    /// driver task and must not block.
    #[instrument(skip(self, variables, callback))]
    pub fn subscribe<F>(
        &self,
        operation: &str,
        variables: Value,
        callback: F,
    ) -> Result<SubscriptionHandle, ClientError>
    where
        F: Fn(&SubscriptionEvent) + Send + Sync + 'static,
    {
        validate(operation, &variables)?;
        let push = self.inner.push()?;
        if push.commands.is_closed() {
            return Err(ClientError::Closed);
        }
        let id = subscription_id(operation, &variables);
        let request = GraphRequest::new(operation, variables);
        let added = self
            .inner
            .registry
            .lock()
            .add(&id, request, Arc::new(callback));
        let handle = SubscriptionHandle::new(
            id.clone(),
            added.listener,
            Arc::clone(&self.inner.registry),
            push.commands.clone(),
        );
        if added.created {
            debug!(id, "NewSubscription");
            // the handle detaches the listener again if this fails
            push.commands
                .send(Command::Subscribe(id))
                .map_err(|_| ClientError::Closed)?;
        }
        Ok(handle)
    }

    /// Like [`DataClient::subscribe`], delivering events through a bounded channel. Events
    /// arriving while the channel is full are dropped.
    pub fn subscribe_stream(
        &self,
        operation: &str,
        variables: Value,
    ) -> Result<(SubscriptionHandle, mpsc::Receiver<SubscriptionEvent>), ClientError> {
        let (tx, rx) = mpsc::channel(self.inner.config.subscription_buffer_size);
        let handle = self.subscribe(operation, variables, move |event| {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!("SubscriptionBufferFull"),
                Err(TrySendError::Closed(_)) => trace!("SubscriptionReceiverDropped"),
            }
        })?;
        Ok((handle, rx))
    }

    /// Number of distinct subscriptions currently registered.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Removes cached entries selected by `matcher`. Returns how many were removed.
    pub fn invalidate(&self, matcher: &CacheMatcher) -> usize {
        self.inner
            .cache
            .as_ref()
            .map_or(0, |cache| cache.lock().invalidate(matcher))
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = self.inner.cache.as_ref() {
            cache.lock().clear();
        }
    }

    /// Cache statistics, `None` when caching is disabled.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.inner
            .cache
            .as_ref()
            .map(|cache| cache.lock().stats())
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.inner.dedup.stats()
    }

    /// Current push connection state. A client without push transports stays disconnected.
    pub fn transport_state(&self) -> TransportState {
        self.inner
            .push
            .as_ref()
            .map(|push| push.state.borrow().clone())
            .unwrap_or_default()
    }

    pub fn watch_transport_state(&self) -> Result<watch::Receiver<TransportState>, ClientError> {
        Ok(self.inner.push()?.state.clone())
    }

    pub fn events(&self) -> Result<broadcast::Receiver<ClientEvent>, ClientError> {
        Ok(self.inner.push()?.events.subscribe())
    }

    /// Clears a terminal connection failure and connects again if subscriptions exist.
    pub fn reconnect(&self) -> Result<(), ClientError> {
        self.inner
            .push()?
            .commands
            .send(Command::Reconnect)
            .map_err(|_| ClientError::Closed)
    }

    /// Stops the push driver and closes its connection. Queries keep working.
    pub async fn close(&self) {
        let Some(push) = self.inner.push.as_ref() else {
            return;
        };
        let _ = push.commands.send(Command::Close);
        let task = push.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "PushDriverFailed");
            }
        }
    }
}
