//! Request/reply correlation for one live socket
//!
//! Every command gets a slot in a FIFO of pending replies. Slots are appended
//! and the encoded bytes handed to the socket's writer task in one critical
//! section, so the Nth reply read always belongs to the Nth command written.
//! The read loop pops slots from the front as replies arrive.
//!
//! Callers never await the socket themselves: once a command is queued it is
//! written in full even if the caller stops waiting, which keeps the reply
//! stream aligned with the slot queue.

use super::transport::BoxedStream;
use super::PushHandler;
use crate::command::Command;
use crate::core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use crate::protocol::{RespDecoder, RespEncoder, ZERO_COPY_THRESHOLD};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

type ReplySender = oneshot::Sender<RedisResult<RespValue>>;

/// Upper bound on the graceful TLS/TCP shutdown once the socket is idle
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Reply future for a command that has been queued on the socket
///
/// Dropping it does not cancel anything: the command is still written, and
/// its reply is read off the wire and discarded so later replies stay
/// aligned.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<RedisResult<RespValue>>,
}

impl Future for PendingReply {
    type Output = RedisResult<RespValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| {
            res.unwrap_or_else(|_| Err(RedisError::closed(None)))
        })
    }
}

#[derive(Default)]
struct PendingQueue {
    queue: VecDeque<ReplySender>,
    /// set once; the terminal cause handed to every later caller
    closed: Option<RedisError>,
}

/// One live socket: its pending-reply queue, the channel feeding its writer
/// task and the signal that stops both background tasks
pub(crate) struct Session {
    id: u64,
    pending: Mutex<PendingQueue>,
    push: Option<Arc<dyn PushHandler>>,
    writes: mpsc::UnboundedSender<Vec<Bytes>>,
    shutdown: watch::Sender<bool>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Wrap the write half of a fresh socket and start its writer task
    pub(crate) fn start(
        id: u64,
        writer: WriteHalf<BoxedStream>,
        push: Option<Arc<dyn PushHandler>>,
    ) -> Arc<Self> {
        let (writes, jobs) = mpsc::unbounded_channel();
        let (shutdown, stop) = watch::channel(false);
        let session = Arc::new(Self {
            id,
            pending: Mutex::new(PendingQueue::default()),
            push,
            writes,
            shutdown,
            writer_task: Mutex::new(None),
        });

        let task = tokio::spawn(write_loop(Arc::downgrade(&session), writer, jobs, stop));
        *session.writer_task.lock() = Some(task);
        session
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.pending.lock().closed.is_some()
    }

    /// Number of replies still owed by the server
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().queue.len()
    }

    /// Queue a batch of commands as one uninterrupted unit
    ///
    /// Does not wait for the socket: the writer task sends the bytes in
    /// queue order, and a write failure closes the session, which rejects
    /// every pending reply with the I/O error.
    ///
    /// # Errors
    ///
    /// Fails if the session is already closed.
    pub(crate) fn enqueue(&self, commands: &[Command]) -> RedisResult<Vec<PendingReply>> {
        let chunks = encode_batch(commands);

        let mut pending = self.pending.lock();
        if let Some(cause) = &pending.closed {
            return Err(RedisError::closed(Some(cause)));
        }
        if self.writes.send(chunks).is_err() {
            return Err(RedisError::closed(None));
        }

        let replies = commands
            .iter()
            .map(|_| {
                let (tx, rx) = oneshot::channel();
                pending.queue.push_back(tx);
                PendingReply { rx }
            })
            .collect();
        drop(pending);

        trace!("Connection {} queued {} command(s)", self.id, commands.len());
        Ok(replies)
    }

    /// Route one decoded reply
    ///
    /// Push messages are offered to the push handler first; everything else
    /// resolves the oldest pending slot.
    ///
    /// # Errors
    ///
    /// A reply with no pending slot means correlation is lost; the caller
    /// must close the session.
    pub(crate) fn dispatch(&self, value: RespValue) -> RedisResult<()> {
        let value = match &self.push {
            Some(handler) => match handler.intercept(value) {
                Some(value) => value,
                None => return Ok(()),
            },
            None => value,
        };

        let Some(tx) = self.pending.lock().queue.pop_front() else {
            return Err(RedisError::Protocol(format!(
                "Received reply with no pending request: {:?}",
                value
            )));
        };

        // receiver gone means the caller stopped waiting; the reply is dropped
        let _ = tx.send(value.into_result());
        Ok(())
    }

    /// Fail every pending request and stop the reader and writer
    ///
    /// Only the first call has any effect. Returns whether this call closed
    /// the session.
    pub(crate) fn close(&self, reason: Option<&RedisError>) -> bool {
        let cause = reason.cloned().unwrap_or_else(|| RedisError::closed(None));
        let drained = {
            let mut pending = self.pending.lock();
            if pending.closed.is_some() {
                return false;
            }
            pending.closed = Some(cause.clone());
            std::mem::take(&mut pending.queue)
        };

        if !drained.is_empty() {
            debug!(
                "Rejecting {} pending request(s) on connection {}: {}",
                drained.len(),
                self.id,
                cause
            );
        }
        for tx in drained {
            let _ = tx.send(Err(cause.clone()));
        }

        self.shutdown.send_replace(true);
        if let Some(handler) = &self.push {
            handler.on_disconnect(&cause);
        }
        true
    }

    /// Wait for the writer task to let go of the socket
    ///
    /// Returns promptly after [`close`](Self::close) even if a write was
    /// blocked on a peer that stopped reading.
    pub(crate) async fn release(&self) {
        let task = self.writer_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Writer task for connection {} failed: {}", self.id, e);
            }
        }
    }
}

/// Encode a batch: small commands share one buffer, large arguments are
/// passed through by reference
fn encode_batch(commands: &[Command]) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    let mut buf = BytesMut::new();

    for command in commands {
        let large = command
            .as_args()
            .iter()
            .any(|arg| arg.len() >= ZERO_COPY_THRESHOLD);

        if large {
            if !buf.is_empty() {
                chunks.push(buf.split().freeze());
            }
            chunks.extend(RespEncoder::encode_chunks(command));
        } else {
            RespEncoder::encode_command(command, &mut buf);
        }
    }
    if !buf.is_empty() {
        chunks.push(buf.freeze());
    }
    chunks
}

/// Resolves once the session has been closed
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        let closed = *stop.borrow_and_update();
        if closed || stop.changed().await.is_err() {
            return;
        }
    }
}

/// Write queued batches in order until the session closes or a write fails
async fn write_loop(
    session: Weak<Session>,
    mut stream: WriteHalf<BoxedStream>,
    mut jobs: mpsc::UnboundedReceiver<Vec<Bytes>>,
    mut stop: watch::Receiver<bool>,
) {
    let id = session.upgrade().map_or(0, |s| s.id);

    let interrupted = loop {
        let mut chunks = tokio::select! {
            biased;
            () = stopped(&mut stop) => break false,
            job = jobs.recv() => match job {
                Some(chunks) => chunks,
                None => break false,
            },
        };
        // pick up everything else already queued
        while let Ok(more) = jobs.try_recv() {
            chunks.extend(more);
        }

        let result = tokio::select! {
            biased;
            () = stopped(&mut stop) => break true,
            result = write_chunks(&mut stream, chunks) => result,
        };

        if let Err(e) = result {
            warn!("Write failed on connection {}: {}", id, e);
            if let Some(session) = session.upgrade() {
                session.close(Some(&e));
            }
            break true;
        }
    };

    if interrupted {
        debug!("Dropping socket of connection {} mid-write", id);
        return;
    }
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, stream.shutdown()).await {
        Ok(Err(e)) => debug!("Error shutting down connection {}: {}", id, e),
        Err(_) => debug!("Shutdown of connection {} timed out", id),
        Ok(Ok(())) => {}
    }
}

/// Write chunks in order, copying small ones into one buffer
async fn write_chunks(
    stream: &mut WriteHalf<BoxedStream>,
    chunks: Vec<Bytes>,
) -> RedisResult<()> {
    let mut buf = BytesMut::new();
    for mut chunk in chunks {
        if chunk.len() < ZERO_COPY_THRESHOLD {
            buf.extend_from_slice(&chunk);
            continue;
        }
        if !buf.is_empty() {
            stream.write_all_buf(&mut buf).await?;
        }
        stream.write_all_buf(&mut chunk).await?;
    }
    if !buf.is_empty() {
        stream.write_all_buf(&mut buf).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Read replies until the socket closes, fails, or the session is closed
pub(crate) async fn read_loop(
    session: Arc<Session>,
    mut reader: ReadHalf<BoxedStream>,
    mut decoder: RespDecoder,
    read_size: usize,
) {
    let mut stop = session.shutdown.subscribe();

    let reason = 'outer: loop {
        let buf = decoder.buffer_mut();
        if buf.capacity() - buf.len() < read_size / 2 {
            buf.reserve(read_size);
        }

        let read = tokio::select! {
            read = reader.read_buf(buf) => read,
            () = stopped(&mut stop) => break None,
        };

        match read {
            Ok(0) => {
                break Some(RedisError::Closed {
                    reason: "connection closed by server".to_string(),
                })
            }
            Ok(_) => {}
            Err(e) => break Some(e.into()),
        }

        loop {
            match decoder.decode() {
                Ok(Some(value)) => {
                    if let Err(e) = session.dispatch(value) {
                        error!("Connection {}: {}", session.id, e);
                        break 'outer Some(e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Connection {}: {}", session.id, e);
                    break 'outer Some(e);
                }
            }
        }
    };

    if let Some(reason) = reason {
        debug!("Read loop for connection {} ended: {}", session.id, reason);
        session.close(Some(&reason));
    }
}
