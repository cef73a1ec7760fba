//! # nimbus-client
//!
//! Async client for the nimbus messaging system.
//!
//! This crate provides:
//! - A long-lived, auto-reconnecting connection with subscription replay
//! - Publish/subscribe with queue groups and header support
//! - Request/reply over a multiplexed inbox
//! - Backpressured, batched command writing
//! - Optional TLS (prefer/require/implicit upgrade policies)
//!
//! ```no_run
//! # async fn example() -> Result<(), nimbus_client::ClientError> {
//! use nimbus_client::{Client, ConnectOptions};
//!
//! let client = Client::connect(ConnectOptions::new("nats://127.0.0.1:4222")).await?;
//! let mut sub = client.subscribe("orders.>").await?;
//! client.publish("orders.eu.created", "hi".into()).await?;
//! let msg = sub.next().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod events;
pub mod inbox;
pub mod options;

mod connection;
mod subscriptions;
mod tls;
mod transport;
mod writer;

pub use client::{Client, Subscriber};
pub use error::ClientError;
pub use events::{ClientEvent, ConnectionStatus};
pub use inbox::InboxStream;
pub use options::{AuthOptions, ConnectOptions, TlsMode, TlsOptions};

pub use nimbus_protocol::{HeaderMap, Message, ServerInfo, StatusCode};
