//! Pipeline support for batching Redis commands
//!
//! A [`Pipeline`] collects commands and writes them to the connection as one
//! uninterrupted batch. Replies come back in the order the commands were
//! added, each with its own success or error.
//!
//! # Examples
//!
//! ```no_run
//! use redis_relay::Client;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::open("redis://localhost:6379")?;
//!
//! let mut pipeline = client.pipeline();
//! pipeline.set("key1", "value1");
//! pipeline.set("key2", "value2");
//! pipeline.get("key1");
//! pipeline.incr("counter");
//!
//! for result in pipeline.execute().await? {
//!     println!("{:?}", result);
//! }
//! # Ok(())
//! # }
//! ```

use crate::command::{Command, ToArg};
use crate::connection::Connection;
use crate::core::{
    error::RedisResult,
    value::{FromResp, RespValue},
};

/// A batch of commands sent in a single write
pub struct Pipeline {
    commands: Vec<Command>,
    connection: Connection,
}

impl Pipeline {
    /// Create an empty pipeline on `connection`
    pub fn new(connection: Connection) -> Self {
        Self {
            commands: Vec::new(),
            connection,
        }
    }

    /// Add a command to the pipeline
    pub fn add(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    /// Add a SET command to the pipeline
    pub fn set(&mut self, key: impl ToArg, value: impl ToArg) -> &mut Self {
        self.add(Command::new("SET").arg(key).arg(value))
    }

    /// Add a GET command to the pipeline
    pub fn get(&mut self, key: impl ToArg) -> &mut Self {
        self.add(Command::new("GET").arg(key))
    }

    /// Add a DEL command to the pipeline
    pub fn del<I, K>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        self.add(Command::new("DEL").args(keys))
    }

    /// Add an INCR command to the pipeline
    pub fn incr(&mut self, key: impl ToArg) -> &mut Self {
        self.add(Command::new("INCR").arg(key))
    }

    /// Add an INCRBY command to the pipeline
    pub fn incr_by(&mut self, key: impl ToArg, increment: i64) -> &mut Self {
        self.add(Command::new("INCRBY").arg(key).arg(increment))
    }

    /// Add an EXPIRE command to the pipeline
    pub fn expire(&mut self, key: impl ToArg, seconds: std::time::Duration) -> &mut Self {
        self.add(Command::new("EXPIRE").arg(key).arg(seconds.as_secs()))
    }

    /// Add a PUBLISH command to the pipeline
    pub fn publish(&mut self, channel: impl ToArg, message: impl ToArg) -> &mut Self {
        self.add(Command::new("PUBLISH").arg(channel).arg(message))
    }

    /// Number of queued commands
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether no commands are queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drop all queued commands
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// The queued commands, in order
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Send every queued command and collect one result per command
    ///
    /// The queue is emptied even if the batch fails. An empty pipeline
    /// returns an empty vector without touching the network.
    ///
    /// # Errors
    ///
    /// Fails only if the batch could not be written; error replies are
    /// reported in the per-command results.
    pub async fn execute(&mut self) -> RedisResult<Vec<RedisResult<RespValue>>> {
        let commands = std::mem::take(&mut self.commands);
        self.connection.send_batch(&commands).await
    }

    /// Send every queued command and convert each reply to `T`
    ///
    /// # Errors
    ///
    /// Fails on the first error reply or conversion failure, or if the batch
    /// could not be written.
    pub async fn execute_typed<T: FromResp>(&mut self) -> RedisResult<Vec<T>> {
        self.execute()
            .await?
            .into_iter()
            .map(|result| result.and_then(T::from_resp))
            .collect()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("commands", &self.commands.len())
            .finish()
    }
}
