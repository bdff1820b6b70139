//! High-level Redis client
//!
//! This module provides the main `Client` interface for interacting with Redis.

use crate::command::{Command, ToArg};
use crate::connection::{Connection, Connector, TcpConnector};
use crate::core::{
    config::ConnectionConfig,
    error::RedisResult,
    value::{FromResp, RespValue},
};
use crate::pipeline::Pipeline;
use crate::pubsub::{IdlePolicy, PubSub};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

/// High-level Redis client
///
/// Wraps one multiplexed [`Connection`] for ordinary commands and, on first
/// use, a separate [`PubSub`] connection for subscriptions. Nothing connects
/// until the first command is sent. Cheap to clone; clones share both
/// connections.
#[derive(Clone)]
pub struct Client {
    connection: Connection,
    connector: Arc<dyn Connector>,
    subscriber: Arc<OnceLock<PubSub>>,
}

impl Client {
    /// Create a client for the given configuration
    ///
    /// # Example
    ///
    /// ```no_run
    /// use redis_relay::{Client, ConnectionConfig};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let client = Client::new(ConnectionConfig::new("localhost", 6379));
    ///     client.set("greeting", "hello").await?;
    ///     Ok(())
    /// }
    /// ```
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    /// Create a client from a `redis://` or `rediss://` URL
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Config`](crate::RedisError::Config) if the URL
    /// is invalid.
    pub fn open(url: &str) -> RedisResult<Self> {
        Ok(Self::new(ConnectionConfig::from_url(url)?))
    }

    /// Create a client whose connections use a custom transport
    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            connection: Connection::with_connector(config, connector.clone()),
            connector,
            subscriber: Arc::new(OnceLock::new()),
        }
    }

    /// The configuration this client was created with
    pub fn config(&self) -> &ConnectionConfig {
        self.connection.config()
    }

    /// The connection used for ordinary commands
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Whether the command connection is open and ready
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Send a command and return the raw reply
    pub async fn send(&self, command: &Command) -> RedisResult<RespValue> {
        self.connection.send(command).await
    }

    /// Send a command and convert the reply
    pub async fn send_as<T: FromResp>(&self, command: &Command) -> RedisResult<T> {
        T::from_resp(self.send(command).await?)
    }

    /// Send a command, then close the command connection
    pub async fn send_once(&self, command: &Command) -> RedisResult<RespValue> {
        self.connection.send_once(command).await
    }

    /// Start a pipeline on the command connection
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.connection.clone())
    }

    /// The Pub/Sub multiplexer, created on first call
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscriber(&self) -> &PubSub {
        self.subscriber.get_or_init(|| {
            debug!("Creating Pub/Sub connection");
            PubSub::with_connector(
                self.config().clone(),
                self.connector.clone(),
                IdlePolicy::default(),
            )
        })
    }

    /// Close both connections; later commands reconnect
    pub async fn close(&self) {
        self.connection.close(None).await;
        if let Some(subscriber) = self.subscriber.get() {
            subscriber.close().await;
        }
    }

    // High-level command methods

    /// Ping the server
    pub async fn ping(&self) -> RedisResult<String> {
        self.send_as(&Command::new("PING")).await
    }

    /// Post a message to a channel, returning how many subscribers got it
    pub async fn publish(&self, channel: impl ToArg, message: impl ToArg) -> RedisResult<i64> {
        self.send_as(&Command::new("PUBLISH").arg(channel).arg(message))
            .await
    }

    /// Get the value of a key
    pub async fn get(&self, key: impl ToArg) -> RedisResult<Option<String>> {
        self.send_as(&Command::new("GET").arg(key)).await
    }

    /// Set the value of a key
    pub async fn set(&self, key: impl ToArg, value: impl ToArg) -> RedisResult<bool> {
        self.send_as(&Command::new("SET").arg(key).arg(value)).await
    }

    /// Set the value of a key with expiration
    pub async fn set_ex(
        &self,
        key: impl ToArg,
        value: impl ToArg,
        expiration: Duration,
    ) -> RedisResult<bool> {
        let command = Command::new("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(expiration.as_secs());
        self.send_as(&command).await
    }

    /// Delete one or more keys
    pub async fn del<I, K>(&self, keys: I) -> RedisResult<i64>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        self.send_as(&Command::new("DEL").args(keys)).await
    }

    /// Increment the integer value of a key by one
    pub async fn incr(&self, key: impl ToArg) -> RedisResult<i64> {
        self.send_as(&Command::new("INCR").arg(key)).await
    }

    /// Set a key's time to live in seconds
    pub async fn expire(&self, key: impl ToArg, duration: Duration) -> RedisResult<bool> {
        self.send_as(&Command::new("EXPIRE").arg(key).arg(duration.as_secs()))
            .await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.config().address())
            .field("connected", &self.is_connected())
            .finish()
    }
}
