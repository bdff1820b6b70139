//! Connection lifecycle
//!
//! A [`Connection`] owns at most one live socket at a time. It connects
//! lazily on first use, runs the AUTH/SELECT handshake before any caller
//! command can be written, and starts over with a fresh socket after the
//! previous one closed.
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Ready -> Closing
//!       ^                            |           |         |
//!       +----------------------------+-----------+---------+
//! ```

pub mod correlator;
pub mod transport;

pub use correlator::PendingReply;
pub use transport::{AsyncStream, BoxedStream, Connector, TcpConnector};

use crate::command::Command;
use crate::core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
    value::RespValue,
};
use crate::protocol::RespDecoder;
use correlator::Session;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Observable lifecycle state of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Transport open, AUTH/SELECT in flight
    Handshaking,
    /// Accepting arbitrary commands
    Ready,
    /// Tearing down the socket
    Closing,
}

/// Hook that sees every decoded reply before it is matched to a request
///
/// Used by the pub/sub multiplexer to pull out push messages that do not
/// answer any command.
pub trait PushHandler: Send + Sync + 'static {
    /// Consume `value` by returning `None`, or hand it back for normal
    /// correlation
    fn intercept(&self, value: RespValue) -> Option<RespValue>;

    /// Called once when the socket this handler was attached to goes away
    fn on_disconnect(&self, _reason: &RedisError) {}
}

type ConnectAttempt = Shared<BoxFuture<'static, RedisResult<Arc<Session>>>>;

const PHASE_CONNECTING: u8 = 0;
const PHASE_HANDSHAKING: u8 = 1;

enum Slot {
    Idle,
    Connecting {
        id: u64,
        attempt: ConnectAttempt,
        phase: Arc<AtomicU8>,
    },
    Ready(Arc<Session>),
    Closing(Arc<Session>),
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    push: Option<Arc<dyn PushHandler>>,
    slot: Mutex<Slot>,
    next_id: AtomicU64,
}

/// A pipelined, multiplexed connection to one Redis server
///
/// Cheap to clone; clones share the socket. Any number of tasks may call
/// [`send`](Self::send) concurrently: each command is written as an
/// uninterrupted unit and replies come back in write order.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a connection that will use TCP (or TLS) to reach the server
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    /// Create a connection that opens its transport through `connector`
    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self::build(config, connector, None)
    }

    pub(crate) fn build(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        push: Option<Arc<dyn PushHandler>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                push,
                slot: Mutex::new(Slot::Idle),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The configuration this connection was created with
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        match &*self.inner.slot.lock() {
            Slot::Idle => ConnectionState::Disconnected,
            Slot::Connecting { phase, .. } => match phase.load(Ordering::Acquire) {
                PHASE_CONNECTING => ConnectionState::Connecting,
                _ => ConnectionState::Handshaking,
            },
            Slot::Ready(session) if session.is_closed() => ConnectionState::Disconnected,
            Slot::Ready(_) => ConnectionState::Ready,
            Slot::Closing(_) => ConnectionState::Closing,
        }
    }

    /// Whether a socket is open and ready for commands
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Number of replies the server still owes on the current socket
    pub fn pending_replies(&self) -> usize {
        match &*self.inner.slot.lock() {
            Slot::Ready(session) | Slot::Closing(session) => session.pending_len(),
            _ => 0,
        }
    }

    /// Open the socket and complete the handshake if not already done
    ///
    /// Concurrent callers share a single attempt.
    ///
    /// # Errors
    ///
    /// Returns the transport or handshake error; the connection goes back
    /// to [`ConnectionState::Disconnected`] and may be retried.
    pub async fn connect(&self) -> RedisResult<()> {
        self.session().await.map(|_| ())
    }

    /// Send one command and wait for its reply
    ///
    /// # Errors
    ///
    /// Error replies become [`RedisError::Server`] and leave the connection
    /// usable. Transport and protocol failures close the connection and are
    /// reported to every outstanding caller.
    pub async fn send(&self, command: &Command) -> RedisResult<RespValue> {
        self.send_pipelined(command).await?.await
    }

    /// Queue one command and return its reply future without waiting for it
    ///
    /// When this returns, the command is queued in write order: commands
    /// queued by sequential calls are answered in that order. It is written
    /// even if the reply future is dropped.
    ///
    /// # Errors
    ///
    /// Fails if connecting fails or the connection is already closed. A
    /// later write failure is reported through the reply future.
    pub async fn send_pipelined(&self, command: &Command) -> RedisResult<PendingReply> {
        let session = self.session().await?;
        let mut replies = session.enqueue(std::slice::from_ref(command))?;
        replies
            .pop()
            .ok_or_else(|| RedisError::Protocol("No reply slot for command".to_string()))
    }

    /// Write several commands as one uninterrupted batch and collect every
    /// reply in order
    ///
    /// Error replies are reported per command; the batch itself only fails
    /// if the commands could not be queued.
    ///
    /// # Errors
    ///
    /// Fails if connecting fails or the connection is already closed.
    pub async fn send_batch(&self, commands: &[Command]) -> RedisResult<Vec<RedisResult<RespValue>>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let session = self.session().await?;
        let replies = session.enqueue(commands)?;

        let mut results = Vec::with_capacity(replies.len());
        for reply in replies {
            results.push(reply.await);
        }
        Ok(results)
    }

    /// Send a command, then close the connection
    ///
    /// # Errors
    ///
    /// Returns whatever [`send`](Self::send) returned.
    pub async fn send_once(&self, command: &Command) -> RedisResult<RespValue> {
        let result = self.send(command).await;
        self.close(None).await;
        result
    }

    /// Close the socket, failing every pending request
    ///
    /// Safe to call repeatedly; only the first call on a given socket has
    /// an effect. The next [`send`](Self::send) reconnects.
    pub async fn close(&self, reason: Option<RedisError>) {
        let session = {
            let mut slot = self.inner.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Ready(session) => {
                    *slot = Slot::Closing(session.clone());
                    Some(session)
                }
                Slot::Connecting { id, .. } => {
                    // the attempt notices the slot changed and discards its socket
                    debug!("Abandoning connection attempt {}", id);
                    None
                }
                Slot::Closing(session) => {
                    *slot = Slot::Closing(session);
                    None
                }
                Slot::Idle => None,
            }
        };

        let Some(session) = session else {
            return;
        };

        if session.close(reason.as_ref()) {
            match &reason {
                Some(reason) => info!("Closing connection {}: {}", session.id(), reason),
                None => debug!("Closing connection {}", session.id()),
            }
        }
        session.release().await;

        let mut slot = self.inner.slot.lock();
        if matches!(&*slot, Slot::Closing(s) if s.id() == session.id()) {
            *slot = Slot::Idle;
        }
    }

    /// Return the live session, connecting first if needed
    async fn session(&self) -> RedisResult<Arc<Session>> {
        let attempt = {
            let mut slot = self.inner.slot.lock();
            match &*slot {
                Slot::Ready(session) if !session.is_closed() => return Ok(session.clone()),
                Slot::Connecting { attempt, .. } => attempt.clone(),
                current => {
                    if matches!(current, Slot::Ready(_)) {
                        info!("Connection lost, reconnecting to {}", self.inner.config.address());
                    }
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let phase = Arc::new(AtomicU8::new(PHASE_CONNECTING));
                    let attempt =
                        open(Arc::downgrade(&self.inner), id, phase.clone()).boxed().shared();
                    *slot = Slot::Connecting {
                        id,
                        attempt: attempt.clone(),
                        phase,
                    };
                    attempt
                }
            }
        };
        attempt.await
    }
}

/// One connect attempt: transport, read loop, handshake
///
/// Holds only a weak reference so an abandoned attempt parked in the slot
/// does not keep the connection alive.
async fn open(inner: Weak<Inner>, id: u64, phase: Arc<AtomicU8>) -> RedisResult<Arc<Session>> {
    let (config, connector, push) = {
        let inner = inner.upgrade().ok_or_else(|| RedisError::closed(None))?;
        (inner.config.clone(), inner.connector.clone(), inner.push.clone())
    };

    let stream = match connector.connect(&config).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to connect to {}: {}", config.address(), e);
            reset_slot(&inner, id);
            return Err(e);
        }
    };

    let (reader, writer) = tokio::io::split(stream);
    let session = Session::start(id, writer, push);
    tokio::spawn(correlator::read_loop(
        session.clone(),
        reader,
        RespDecoder::with_capacity(config.read_buffer_size),
        config.read_buffer_size,
    ));

    phase.store(PHASE_HANDSHAKING, Ordering::Release);
    if let Err(e) = handshake(&session, &config).await {
        warn!("Handshake with {} failed: {}", config.address(), e);
        session.close(Some(&e));
        session.release().await;
        reset_slot(&inner, id);
        return Err(e);
    }

    let installed = match inner.upgrade() {
        Some(inner) => {
            let mut slot = inner.slot.lock();
            if matches!(&*slot, Slot::Connecting { id: current, .. } if *current == id) {
                *slot = Slot::Ready(session.clone());
                true
            } else {
                false
            }
        }
        None => false,
    };

    if !installed {
        debug!("Connection attempt {} was closed before it completed", id);
        let err = RedisError::closed(None);
        session.close(Some(&err));
        session.release().await;
        return Err(err);
    }

    info!("Connected to Redis at {} (connection {})", config.address(), id);
    Ok(session)
}

fn reset_slot(inner: &Weak<Inner>, id: u64) {
    if let Some(inner) = inner.upgrade() {
        let mut slot = inner.slot.lock();
        if matches!(&*slot, Slot::Connecting { id: current, .. } if *current == id) {
            *slot = Slot::Idle;
        }
    }
}

/// Commands that must precede everything else on a fresh socket
pub(crate) fn handshake_commands(config: &ConnectionConfig) -> Vec<Command> {
    let mut commands = Vec::new();
    if !config.needs_handshake() {
        return commands;
    }
    if let Some(password) = &config.password {
        let mut auth = Command::new("AUTH");
        if let Some(username) = &config.username {
            auth = auth.arg(username);
        }
        commands.push(auth.arg(password));
    }
    if config.database != 0 {
        commands.push(Command::new("SELECT").arg(config.database));
    }
    commands
}

/// Pipeline AUTH and SELECT, then wait for both replies
async fn handshake(session: &Session, config: &ConnectionConfig) -> RedisResult<()> {
    let commands = handshake_commands(config);
    if commands.is_empty() {
        return Ok(());
    }
    debug!("Authenticating with Redis server");

    let replies = session.enqueue(&commands)?;
    for (command, reply) in commands.iter().zip(replies) {
        match reply.await {
            Ok(_) => {}
            Err(RedisError::Server(msg)) if command.name() == "AUTH" => {
                return Err(RedisError::Auth(msg))
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
