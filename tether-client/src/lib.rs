//! Resilient real-time data client.
//!
//! [`DataClient`] runs queries and mutations over HTTP with response caching and request
//! deduplication, and keeps subscriptions alive over a push transport. The push side
//! reconnects with exponential backoff, watches the connection with heartbeats, and falls
//! back from websocket to server-sent events to polling when a transport keeps failing.
pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod fallback;
pub mod persistence;
pub mod reconnect;
pub mod rpc;
pub mod subscriptions;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{ClientError, DataClient, DataClientBuilder};
pub use config::ClientConfig;
pub use connection::{ClientEvent, TransportState};
pub use reconnect::ConnectionStatus;
pub use rpc::{HttpGraphClient, RPCError};
pub use subscriptions::{SubscriptionEvent, SubscriptionHandle};
pub use transport::TransportKind;
