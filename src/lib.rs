//! Async Redis client core for Rust
//!
//! `redis-relay` speaks RESP over a single multiplexed socket per
//! [`Connection`]. Any number of tasks can issue commands concurrently; each
//! command is written as one unit and replies are matched back to callers in
//! write order. Pub/Sub runs on its own connection and fans messages out to
//! independent [`Subscription`] streams.
//!
//! # Features
//!
//! - Incremental RESP decoder that tolerates arbitrary fragmentation
//! - Lazy connect with AUTH/SELECT handshake and transparent reconnect
//! - Pipelining with per-command results
//! - Reference-counted channel and pattern subscriptions
//! - TLS via rustls
//!
//! # Quick Start
//!
//! ```no_run
//! use redis_relay::{cmd, Client};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::open("redis://localhost:6379")?;
//!
//!     client.set("mykey", "myvalue").await?;
//!     let value: Option<String> = client.get("mykey").await?;
//!     println!("Value: {:?}", value);
//!
//!     let len: i64 = client.send_as(&cmd!("STRLEN", "mykey")).await?;
//!     println!("Length: {}", len);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::manual_let_else)]

pub mod client;
pub mod command;
pub mod connection;
pub mod core;
pub mod pipeline;
pub mod protocol;
pub mod pubsub;

pub use client::Client;
pub use command::{Command, ToArg};
pub use connection::{
    BoxedStream, Connection, ConnectionState, Connector, PendingReply, PushHandler, TcpConnector,
};
pub use pipeline::Pipeline;
pub use pubsub::{CancelHandle, IdlePolicy, PubSub, PubSubMessage, Subscription, SubscriptionKey};

pub use crate::core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
    value::{FromResp, RespValue},
};
