use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_appender::rolling;

use crate::{
    client::DataClient,
    config::ClientConfig,
    connection::ClientEvent,
    persistence::FileEventIdStore,
    subscriptions::SubscriptionEvent,
    transport::TransportKind,
};

/// Tether Client CLI - query, mutate and subscribe against a graph API
///
/// Subscriptions stay alive across network failures: the client reconnects with backoff and
/// falls back from websocket to server-sent events to polling when a transport keeps failing.
#[derive(Parser, Debug, Clone, PartialEq)]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct CliArgs {
    /// HTTP endpoint for queries and mutations. Example: http://localhost:4000/graphql
    #[clap(long, default_value = "http://localhost:4000/graphql", env = "TETHER_URL")]
    url: String,

    /// WebSocket endpoint for subscriptions.
    #[clap(long, env = "TETHER_WS_URL")]
    ws_url: Option<String>,

    /// Server-sent event endpoint for subscriptions.
    #[clap(long, env = "TETHER_SSE_URL")]
    sse_url: Option<String>,

    /// Polling endpoint for subscriptions.
    #[clap(long, env = "TETHER_POLL_URL")]
    poll_url: Option<String>,

    /// Bearer token sent on every connection. Can be set with TETHER_AUTH_TOKEN env variable.
    #[clap(short = 'k', long, env = "TETHER_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// YAML configuration file. Endpoint and token flags override its values.
    #[clap(long)]
    config: Option<String>,

    /// Only use this transport: websocket, event_stream or polling.
    #[clap(long)]
    transport: Option<TransportKind>,

    /// Logging folder path.
    #[clap(long, default_value = "logs")]
    log_folder: String,

    /// File remembering the last event id, so a restarted subscription resumes where the
    /// previous run stopped.
    #[clap(long)]
    event_id_store: Option<String>,

    /// Enable verbose logging.
    #[clap(long)]
    verbose: bool,

    #[clap(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum CliCommand {
    /// Run a query and print its data as JSON.
    Query {
        operation: String,
        /// Variables as a JSON object.
        #[clap(long, default_value = "{}")]
        variables: String,
    },
    /// Run a mutation and print its data as JSON.
    Mutate {
        operation: String,
        #[clap(long, default_value = "{}")]
        variables: String,
    },
    /// Subscribe and print every event as JSON until interrupted.
    Subscribe {
        operation: String,
        #[clap(long, default_value = "{}")]
        variables: String,
        /// Exit after this many events.
        #[clap(short = 'n', long)]
        max_messages: Option<usize>,
    },
}

impl CliArgs {
    fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = match self.config.as_deref() {
            Some(path) => ClientConfig::from_yaml(path)?,
            None => ClientConfig::new(&self.url),
        };
        if self.config.is_none() || self.url != CliArgs::default_url() {
            config.endpoints.http = self.url.clone();
        }
        if let Some(url) = &self.ws_url {
            config.endpoints.websocket = Some(url.clone());
        }
        if let Some(url) = &self.sse_url {
            config.endpoints.event_stream = Some(url.clone());
        }
        if let Some(url) = &self.poll_url {
            config.endpoints.polling = Some(url.clone());
        }
        if self.auth_token.is_some() {
            config.auth_token = self.auth_token.clone();
        }
        if self.transport.is_some() {
            config.transport.force = self.transport;
        }
        config.validate()?;
        Ok(config)
    }

    fn default_url() -> &'static str {
        "http://localhost:4000/graphql"
    }
}

fn parse_variables(raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("Invalid variables: {raw}"))
}

pub async fn run_cli() -> anyhow::Result<()> {
    let args: CliArgs = CliArgs::parse();
    let config = args.client_config()?;

    // Setup Logging
    let log_level = if args.verbose { "debug" } else { "info" };
    let (non_blocking, _guard) =
        tracing_appender::non_blocking(rolling::never(&args.log_folder, "tether_client.log"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(non_blocking)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("Failed to set up logging subscriber: {e}"))?;

    info!("Running with version: {}", option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"));
    debug!(?config, "ClientConfig");

    let mut builder = DataClient::builder(config);
    if let Some(path) = &args.event_id_store {
        let store = FileEventIdStore::open(path)
            .with_context(|| format!("Failed to open event id store {path}"))?;
        builder = builder.event_id_store(Arc::new(store));
    }
    let client = builder.build()?;

    let res = run(&client, args.command).await;
    client.close().await;
    res
}

async fn run(client: &DataClient, command: CliCommand) -> anyhow::Result<()> {
    match command {
        CliCommand::Query { operation, variables } => {
            let data = client
                .query(&operation, parse_variables(&variables)?)
                .await?;
            println!("{}", serde_json::to_string(&data)?);
        }
        CliCommand::Mutate { operation, variables } => {
            let data = client
                .mutate(&operation, parse_variables(&variables)?)
                .await?;
            println!("{}", serde_json::to_string(&data)?);
        }
        CliCommand::Subscribe { operation, variables, max_messages } => {
            subscribe(client, &operation, parse_variables(&variables)?, max_messages).await?;
        }
    }
    Ok(())
}

async fn subscribe(
    client: &DataClient,
    operation: &str,
    variables: Value,
    max_messages: Option<usize>,
) -> anyhow::Result<()> {
    let mut events = client.events()?;
    let (handle, mut rx) = client.subscribe_stream(operation, variables)?;
    info!(id = handle.id(), "Subscribed");

    let mut received = 0usize;
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    bail!("Subscription channel closed");
                };
                match event {
                    SubscriptionEvent::Data(payload) => println!("{}", serde_json::to_string(&payload)?),
                    SubscriptionEvent::Error(payload) => {
                        warn!(%payload, "SubscriptionError");
                        eprintln!("{}", serde_json::to_string(&payload)?);
                    }
                }
                received += 1;
                if max_messages.is_some_and(|max| received >= max) {
                    info!(received, "MaxMessagesReached");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(ClientEvent::ConnectionTerminated { error }) => {
                    error!(%error, "ConnectionTerminated");
                    bail!("Connection terminated: {error}");
                }
                Ok(ClientEvent::TransportSwitched(switch)) => {
                    info!(from = %switch.from, to = %switch.to, reason = %switch.reason, "TransportSwitched");
                }
                Ok(ClientEvent::StatusChanged { from, to }) => debug!(%from, %to, "StatusChanged"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "EventsLagged"),
                Err(RecvError::Closed) => bail!("Push driver stopped"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            },
        }
    }
    handle.unsubscribe();
    Ok(())
}
