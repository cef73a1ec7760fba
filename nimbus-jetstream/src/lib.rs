//! # nimbus-jetstream
//!
//! Client for the durable stream layer of the nimbus messaging system.
//!
//! This crate provides:
//! - A typed JSON admin API client over the `$JS.API.` subject namespace
//! - Stream and consumer management (create, update, delete, info, purge)
//! - A pull consumer with credit-based flow control and heartbeat
//!   supervision
//! - An ordered consumer that recovers from delivery gaps transparently
//!
//! ```no_run
//! # async fn example() -> Result<(), nimbus_jetstream::Error> {
//! use nimbus_client::{Client, ConnectOptions};
//! use nimbus_jetstream::{ConsumeConfig, Context, StreamConfig};
//!
//! let client = Client::connect(ConnectOptions::new("nats://127.0.0.1:4222")).await?;
//! let js = Context::new(client);
//!
//! let stream = js
//!     .create_stream(StreamConfig {
//!         name: "ORDERS".into(),
//!         subjects: vec!["orders.>".into()],
//!         ..Default::default()
//!     })
//!     .await?;
//!
//! let consumer = stream
//!     .create_consumer(nimbus_jetstream::ConsumerConfig {
//!         durable_name: Some("processor".into()),
//!         ..Default::default()
//!     })
//!     .await?;
//!
//! let (mut messages, _notifications) = consumer
//!     .consume(ConsumeConfig::new().with_max_msgs(500))
//!     .await?;
//! while let Some(message) = messages.next().await {
//!     message?.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod consumer;
pub mod error;
pub mod message;
pub mod ordered;
pub mod stream;

mod nanos;

pub use api::{Context, DEFAULT_API_PREFIX};
pub use consumer::{
    AckPolicy, ConsumeConfig, Consumer, ConsumerConfig, ConsumerInfo, ConsumerNotification,
    DeliverPolicy, MessageStream, ReplayPolicy, SequenceInfo,
};
pub use error::{ApiError, Error};
pub use message::{AckKind, MessageInfo, StreamMessage};
pub use ordered::{OrderedConfig, OrderedStream};
pub use stream::{
    DiscardPolicy, RawMessage, RetentionPolicy, StorageType, Stream, StreamConfig, StreamInfo,
    StreamState,
};
