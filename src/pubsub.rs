//! Pub/Sub support for Redis
//!
//! [`PubSub`] runs its own dedicated [`Connection`] and fans incoming
//! `message`/`pmessage` frames out to any number of [`Subscription`]
//! streams. Subscriptions are reference counted per channel or pattern: the
//! first consumer of a key sends `SUBSCRIBE`/`PSUBSCRIBE`, later ones attach
//! without a round trip, and `UNSUBSCRIBE`/`PUNSUBSCRIBE` goes out once the
//! last consumer of that key is gone.
//!
//! # Examples
//!
//! ```no_run
//! use redis_relay::{Client, SubscriptionKey};
//! use futures_util::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::open("redis://localhost:6379")?;
//! let mut news = client
//!     .subscriber()
//!     .subscribe([SubscriptionKey::channel("news"), SubscriptionKey::pattern("alerts.*")])
//!     .await?;
//!
//! while let Some(message) = news.next().await {
//!     println!("{}: {}", message.channel_str()?, message.payload_str()?);
//! }
//! # Ok(())
//! # }
//! ```

use crate::command::{Command, ToArg};
use crate::connection::{Connection, ConnectionState, Connector, PushHandler, TcpConnector};
use crate::core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
    value::RespValue,
};
use bytes::Bytes;
use futures_util::Stream;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// A channel name or a channel pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    /// Exact channel, subscribed with `SUBSCRIBE`
    Channel(Bytes),
    /// Glob-style pattern, subscribed with `PSUBSCRIBE`
    Pattern(Bytes),
}

impl SubscriptionKey {
    /// An exact channel
    pub fn channel(name: impl ToArg) -> Self {
        Self::Channel(name.to_arg())
    }

    /// A channel pattern such as `news.*`
    pub fn pattern(pattern: impl ToArg) -> Self {
        Self::Pattern(pattern.to_arg())
    }

    /// Keyspace notifications for keys matching `pattern`
    ///
    /// `database` of `None` listens on every database.
    pub fn keyspace(pattern: &str, database: Option<u32>) -> Self {
        Self::Pattern(Bytes::from(format!(
            "__keyspace@{}__:{}",
            db_selector(database),
            pattern
        )))
    }

    /// Keyevent notifications for events matching `event` (e.g. `expired`)
    pub fn keyevent(event: &str, database: Option<u32>) -> Self {
        Self::Pattern(Bytes::from(format!(
            "__keyevent@{}__:{}",
            db_selector(database),
            event
        )))
    }

    /// The channel name or pattern text
    pub fn name(&self) -> &Bytes {
        match self {
            Self::Channel(name) | Self::Pattern(name) => name,
        }
    }

    /// Whether this is a pattern subscription
    pub const fn is_pattern(&self) -> bool {
        matches!(self, Self::Pattern(_))
    }

    fn subscribe_command(&self) -> Command {
        match self {
            Self::Channel(name) => Command::new("SUBSCRIBE").arg(name),
            Self::Pattern(name) => Command::new("PSUBSCRIBE").arg(name),
        }
    }

    fn unsubscribe_command(&self) -> Command {
        match self {
            Self::Channel(name) => Command::new("UNSUBSCRIBE").arg(name),
            Self::Pattern(name) => Command::new("PUNSUBSCRIBE").arg(name),
        }
    }

    fn ack_kind(&self) -> &'static [u8] {
        match self {
            Self::Channel(_) => b"subscribe",
            Self::Pattern(_) => b"psubscribe",
        }
    }
}

fn db_selector(database: Option<u32>) -> String {
    database.map_or_else(|| "*".to_string(), |db| db.to_string())
}

/// A message received from a Redis channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// The channel the message was published on
    pub channel: Bytes,
    /// The message payload
    pub payload: Bytes,
    /// The pattern that matched (for pattern subscriptions)
    pub pattern: Option<Bytes>,
}

impl PubSubMessage {
    /// Channel name as UTF-8
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Type`] if the name is not valid UTF-8.
    pub fn channel_str(&self) -> RedisResult<&str> {
        std::str::from_utf8(&self.channel)
            .map_err(|e| RedisError::Type(format!("Invalid UTF-8 channel: {e}")))
    }

    /// Payload as UTF-8
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Type`] if the payload is not valid UTF-8.
    pub fn payload_str(&self) -> RedisResult<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| RedisError::Type(format!("Invalid UTF-8 payload: {e}")))
    }
}

/// What to do with the dedicated connection once nothing is subscribed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdlePolicy {
    /// Keep the socket open for future subscriptions
    KeepAlive,
    /// Close the socket; the next subscribe reconnects
    #[default]
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// SUBSCRIBE sent, confirmation not yet seen
    PendingAck,
    /// Confirmed by the server
    Active,
}

#[derive(Debug)]
struct Entry {
    state: EntryState,
    consumers: HashSet<u64>,
}

struct Consumer {
    keys: Vec<SubscriptionKey>,
    tx: mpsc::UnboundedSender<PubSubMessage>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<SubscriptionKey, Entry>,
    consumers: HashMap<u64, Consumer>,
    next_consumer: u64,
}

impl RegistryState {
    /// Add a consumer to entries that already exist for every key
    fn add_consumer(
        &mut self,
        keys: &[SubscriptionKey],
    ) -> (u64, mpsc::UnboundedReceiver<PubSubMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_consumer;
        self.next_consumer += 1;

        for key in keys {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.consumers.insert(id);
            }
        }
        self.consumers.insert(
            id,
            Consumer {
                keys: keys.to_vec(),
                tx,
            },
        );
        (id, rx)
    }
}

/// Subscription bookkeeping shared by the read loop, subscribers and
/// cancellations
struct Registry {
    state: Mutex<RegistryState>,
    reconcile: mpsc::UnboundedSender<()>,
}

impl Registry {
    /// Register a consumer for `keys`, creating entries for keys not yet
    /// tracked. Returns the consumer id, its receiver and the new keys.
    fn attach(
        &self,
        keys: &[SubscriptionKey],
    ) -> (u64, mpsc::UnboundedReceiver<PubSubMessage>, Vec<SubscriptionKey>) {
        let mut state = self.state.lock();
        let mut fresh = Vec::new();
        for key in keys {
            if !state.entries.contains_key(key) {
                state.entries.insert(
                    key.clone(),
                    Entry {
                        state: EntryState::PendingAck,
                        consumers: HashSet::new(),
                    },
                );
                fresh.push(key.clone());
            }
        }
        let (id, rx) = state.add_consumer(keys);
        (id, rx, fresh)
    }

    /// Attach only if every key is already confirmed by the server
    fn attach_active(
        &self,
        keys: &[SubscriptionKey],
    ) -> Option<(u64, mpsc::UnboundedReceiver<PubSubMessage>)> {
        let mut state = self.state.lock();
        let all_active = keys.iter().all(|key| {
            matches!(state.entries.get(key), Some(entry) if entry.state == EntryState::Active)
        });
        all_active.then(|| state.add_consumer(keys))
    }

    /// Mark a key confirmed. Returns false if the entry was dropped while
    /// the confirmation was in flight.
    fn acknowledge(&self, key: &SubscriptionKey) -> bool {
        match self.state.lock().entries.get_mut(key) {
            Some(entry) => {
                entry.state = EntryState::Active;
                true
            }
            None => false,
        }
    }

    /// Forget a key the server refused
    fn discard(&self, key: &SubscriptionKey) {
        self.state.lock().entries.remove(key);
    }

    /// Remove a consumer from every key it references
    fn detach(&self, id: u64) {
        let mut state = self.state.lock();
        let Some(consumer) = state.consumers.remove(&id) else {
            return;
        };

        let mut emptied = false;
        for key in &consumer.keys {
            if let Some(entry) = state.entries.get_mut(key) {
                entry.consumers.remove(&id);
                emptied |= entry.consumers.is_empty();
            }
        }
        drop(state);

        if emptied {
            let _ = self.reconcile.send(());
        }
    }

    /// Remove confirmed entries nobody listens to any more
    ///
    /// Entries still waiting for their confirmation are left alone; the
    /// UNSUBSCRIBE for them may only follow the SUBSCRIBE's reply.
    fn take_idle(&self) -> Vec<SubscriptionKey> {
        let mut state = self.state.lock();
        let idle: Vec<SubscriptionKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.state == EntryState::Active && entry.consumers.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &idle {
            state.entries.remove(key);
        }
        idle
    }

    fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    fn keys(&self, pattern: bool) -> Vec<SubscriptionKey> {
        self.state
            .lock()
            .entries
            .keys()
            .filter(|key| key.is_pattern() == pattern)
            .cloned()
            .collect()
    }

    fn deliver(&self, key: &SubscriptionKey, message: PubSubMessage) {
        let state = self.state.lock();
        let Some(entry) = state.entries.get(key) else {
            debug!("Dropping message for untracked key {:?}", key);
            return;
        };
        for id in &entry.consumers {
            if let Some(consumer) = state.consumers.get(id) {
                // a closed receiver is detached by its Drop shortly
                let _ = consumer.tx.send(message.clone());
            }
        }
    }
}

impl PushHandler for Registry {
    fn intercept(&self, value: RespValue) -> Option<RespValue> {
        let RespValue::Array(items) = &value else {
            return Some(value);
        };

        match items.as_slice() {
            [RespValue::BulkString(kind), RespValue::BulkString(channel), RespValue::BulkString(payload)]
                if kind.as_ref() == b"message" =>
            {
                self.deliver(
                    &SubscriptionKey::Channel(channel.clone()),
                    PubSubMessage {
                        channel: channel.clone(),
                        payload: payload.clone(),
                        pattern: None,
                    },
                );
                None
            }
            [RespValue::BulkString(kind), RespValue::BulkString(pattern), RespValue::BulkString(channel), RespValue::BulkString(payload)]
                if kind.as_ref() == b"pmessage" =>
            {
                self.deliver(
                    &SubscriptionKey::Pattern(pattern.clone()),
                    PubSubMessage {
                        channel: channel.clone(),
                        payload: payload.clone(),
                        pattern: Some(pattern.clone()),
                    },
                );
                None
            }
            _ => Some(value),
        }
    }

    fn on_disconnect(&self, reason: &RedisError) {
        let mut state = self.state.lock();
        if state.entries.is_empty() && state.consumers.is_empty() {
            return;
        }
        info!(
            "Pub/Sub connection lost, ending {} subscription(s): {}",
            state.consumers.len(),
            reason
        );
        // dropping the senders ends every consumer stream
        state.entries.clear();
        state.consumers.clear();
    }
}

struct PubSubInner {
    connection: Connection,
    registry: Arc<Registry>,
    /// serializes (un)subscribe round trips so wire order matches the
    /// registry's decisions
    ops: Arc<tokio::sync::Mutex<()>>,
    policy: IdlePolicy,
}

/// Multiplexes Pub/Sub subscriptions over one dedicated connection
///
/// Must be created inside a Tokio runtime: a background task sends the
/// unsubscribe commands for cancelled subscriptions.
#[derive(Clone)]
pub struct PubSub {
    inner: Arc<PubSubInner>,
}

impl PubSub {
    /// Create a multiplexer that connects over TCP/TLS on first subscribe
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, Arc::new(TcpConnector), IdlePolicy::default())
    }

    /// Create a multiplexer with a custom transport and idle policy
    pub fn with_connector(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        policy: IdlePolicy,
    ) -> Self {
        let (reconcile_tx, reconcile_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry {
            state: Mutex::new(RegistryState::default()),
            reconcile: reconcile_tx,
        });
        let push: Arc<dyn PushHandler> = registry.clone();
        let connection = Connection::build(config, connector, Some(push));

        let inner = Arc::new(PubSubInner {
            connection,
            registry,
            ops: Arc::new(tokio::sync::Mutex::new(())),
            policy,
        });
        tokio::spawn(reconcile_loop(Arc::downgrade(&inner), reconcile_rx));
        Self { inner }
    }

    /// The dedicated connection carrying the subscriptions
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Subscribe one consumer to a set of channels and/or patterns
    ///
    /// Keys nobody is subscribed to yet are confirmed with the server before
    /// this returns; keys already confirmed are attached without a round
    /// trip. All keys feed the one returned stream, and dropping it (or
    /// calling [`CancelHandle::cancel`]) detaches it from all of them.
    ///
    /// # Errors
    ///
    /// Fails if no keys are given, if the connection fails, or if the server
    /// rejects a subscription. Nothing stays subscribed on behalf of a failed
    /// call.
    pub async fn subscribe<I>(&self, keys: I) -> RedisResult<Subscription>
    where
        I: IntoIterator<Item = SubscriptionKey>,
    {
        let mut unique = Vec::new();
        for key in keys {
            if !unique.contains(&key) {
                unique.push(key);
            }
        }
        if unique.is_empty() {
            return Err(RedisError::Config(
                "subscribe needs at least one channel or pattern".to_string(),
            ));
        }

        let registry = &self.inner.registry;
        if let Some((id, rx)) = registry.attach_active(&unique) {
            debug!("Attached consumer {} to {} active key(s)", id, unique.len());
            return Ok(Subscription::new(id, unique, rx, registry));
        }

        let ops = self.inner.ops.clone().lock_owned().await;
        let (id, rx, fresh) = registry.attach(&unique);
        let subscription = Subscription::new(id, unique, rx, registry);
        if fresh.is_empty() {
            return Ok(subscription);
        }

        // runs to completion even if this call is dropped, so the lock is
        // held until every confirmation has been processed
        let confirm = tokio::spawn(confirm(self.inner.clone(), fresh, ops));
        match confirm.await {
            Ok(Ok(())) => Ok(subscription),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(RedisError::Connection(format!(
                "Subscribe task failed: {}",
                e
            ))),
        }
    }

    /// Subscribe to a single exact channel
    ///
    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub async fn subscribe_channel(&self, channel: impl ToArg) -> RedisResult<Subscription> {
        self.subscribe([SubscriptionKey::channel(channel)]).await
    }

    /// Subscribe to a single pattern
    ///
    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub async fn subscribe_pattern(&self, pattern: impl ToArg) -> RedisResult<Subscription> {
        self.subscribe([SubscriptionKey::pattern(pattern)]).await
    }

    /// Channels with at least one live subscription
    pub fn channels(&self) -> Vec<Bytes> {
        self.inner
            .registry
            .keys(false)
            .into_iter()
            .map(|key| key.name().clone())
            .collect()
    }

    /// Patterns with at least one live subscription
    pub fn patterns(&self) -> Vec<Bytes> {
        self.inner
            .registry
            .keys(true)
            .into_iter()
            .map(|key| key.name().clone())
            .collect()
    }

    /// True when nothing is subscribed
    pub fn is_idle(&self) -> bool {
        self.inner.registry.is_empty()
    }

    /// Close the dedicated connection, ending every subscription
    pub async fn close(&self) {
        self.inner.connection.close(None).await;
    }

    /// Send unsubscribe commands for keys whose last consumer went away
    async fn reconcile(&self) {
        let _ops = self.inner.ops.lock().await;
        let idle = self.inner.registry.take_idle();

        // a fresh socket carries no subscriptions, so only a live one needs cleanup
        if !idle.is_empty() && self.inner.connection.is_connected() {
            debug!("Unsubscribing from {} idle key(s)", idle.len());
            let commands: Vec<Command> = idle
                .iter()
                .map(SubscriptionKey::unsubscribe_command)
                .collect();
            match self.inner.connection.send_batch(&commands).await {
                Ok(replies) => {
                    for (key, reply) in idle.iter().zip(replies) {
                        if let Err(e) = reply {
                            warn!("Unsubscribe from {:?} failed: {}", key, e);
                        }
                    }
                }
                Err(e) => warn!("Unsubscribe failed: {}", e),
            }
        }

        if self.inner.policy == IdlePolicy::Close
            && self.inner.registry.is_empty()
            && self.inner.connection.state() == ConnectionState::Ready
        {
            debug!("No subscriptions left, closing Pub/Sub connection");
            self.inner.connection.close(None).await;
        }
    }
}

/// Send SUBSCRIBE/PSUBSCRIBE for new keys and record the server's answers
async fn confirm(
    inner: Arc<PubSubInner>,
    fresh: Vec<SubscriptionKey>,
    _ops: OwnedMutexGuard<()>,
) -> RedisResult<()> {
    debug!("Subscribing to {} new key(s)", fresh.len());
    let registry = &inner.registry;
    let commands: Vec<Command> = fresh
        .iter()
        .map(SubscriptionKey::subscribe_command)
        .collect();
    let mut failure = None;
    let mut orphaned = Vec::new();

    match inner.connection.send_batch(&commands).await {
        Ok(replies) => {
            for (key, reply) in fresh.iter().zip(replies) {
                match reply.and_then(|ack| check_ack(key, &ack)) {
                    Ok(()) => {
                        if !registry.acknowledge(key) {
                            orphaned.push(key.clone());
                        }
                    }
                    Err(e) => {
                        warn!("Subscribe to {:?} failed: {}", key, e);
                        registry.discard(key);
                        failure.get_or_insert(e);
                    }
                }
            }
        }
        Err(e) => {
            for key in &fresh {
                registry.discard(key);
            }
            failure = Some(e);
        }
    }

    // confirmed by the server after the registry was reset by a disconnect
    if !orphaned.is_empty() {
        let commands: Vec<Command> = orphaned
            .iter()
            .map(SubscriptionKey::unsubscribe_command)
            .collect();
        if let Err(e) = inner.connection.send_batch(&commands).await {
            debug!("Failed to drop orphaned subscriptions: {}", e);
        }
        failure.get_or_insert_with(|| RedisError::closed(None));
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn check_ack(key: &SubscriptionKey, ack: &RespValue) -> RedisResult<()> {
    match ack {
        RespValue::Array(items)
            if matches!(items.first(), Some(RespValue::BulkString(kind)) if kind.as_ref() == key.ack_kind()) =>
        {
            Ok(())
        }
        other => Err(RedisError::UnexpectedResponse(format!(
            "Expected {} confirmation, got {:?}",
            String::from_utf8_lossy(key.ack_kind()),
            other
        ))),
    }
}

async fn reconcile_loop(inner: Weak<PubSubInner>, mut wake: mpsc::UnboundedReceiver<()>) {
    while wake.recv().await.is_some() {
        // coalesce bursts of cancellations into one pass
        while wake.try_recv().is_ok() {}
        let Some(inner) = inner.upgrade() else {
            break;
        };
        PubSub { inner }.reconcile().await;
    }
}

/// One consumer's stream of messages
///
/// Dropping it cancels the subscription for every key it was created with.
pub struct Subscription {
    id: u64,
    keys: Vec<SubscriptionKey>,
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
    registry: Arc<Registry>,
}

impl Subscription {
    fn new(
        id: u64,
        keys: Vec<SubscriptionKey>,
        rx: mpsc::UnboundedReceiver<PubSubMessage>,
        registry: &Arc<Registry>,
    ) -> Self {
        Self {
            id,
            keys,
            rx,
            registry: registry.clone(),
        }
    }

    /// The channels and patterns this consumer listens to
    pub fn keys(&self) -> &[SubscriptionKey] {
        &self.keys
    }

    /// Wait for the next message; `None` once cancelled or disconnected
    pub async fn next_message(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }

    /// Wait for the next message for at most `duration`
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Timeout`] if nothing arrived in time.
    pub async fn next_message_timeout(
        &mut self,
        duration: Duration,
    ) -> RedisResult<Option<PubSubMessage>> {
        tokio::time::timeout(duration, self.rx.recv())
            .await
            .map_err(|_| RedisError::Timeout)
    }

    /// A handle that can cancel this subscription from elsewhere
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            id: self.id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Stop receiving; buffered messages can still be drained
    pub fn cancel(&self) {
        self.registry.detach(self.id);
    }
}

impl Stream for Subscription {
    type Item = PubSubMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.detach(self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("keys", &self.keys)
            .finish()
    }
}

/// Cancels a [`Subscription`] without owning it
#[derive(Debug, Clone)]
pub struct CancelHandle {
    id: u64,
    registry: Weak<Registry>,
}

impl CancelHandle {
    /// Detach the subscription from all its keys; its stream then ends
    pub fn cancel(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.id);
        }
    }
}
