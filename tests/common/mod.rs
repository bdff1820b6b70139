//! In-memory Redis stand-in for integration tests
//!
//! [`MockConnector`] hands the client one end of a `tokio::io::duplex` pipe
//! per connect and passes the other end to the test as a [`MockServer`],
//! which reads commands and writes scripted replies.

#![allow(dead_code)]

use async_trait::async_trait;
use redis_relay::protocol::RespDecoder;
use redis_relay::{BoxedStream, ConnectionConfig, Connector, RedisError, RedisResult, RespValue};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};

const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
    connects: AtomicUsize,
    refuse: AtomicBool,
    capacity: usize,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, Accepts) {
        Self::with_capacity(64 * 1024)
    }

    /// Pipes that hold at most `capacity` unread bytes, so a server that
    /// stops reading blocks the client's writes
    pub fn with_capacity(capacity: usize) -> (Arc<Self>, Accepts) {
        init_tracing();
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            servers: tx,
            connects: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            capacity,
        });
        (connector, Accepts(Mutex::new(rx)))
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _config: &ConnectionConfig) -> RedisResult<BoxedStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RedisError::Connection("connection refused".to_string()));
        }
        let (client, server) = tokio::io::duplex(self.capacity);
        self.servers
            .send(MockServer {
                stream: server,
                decoder: RespDecoder::new(),
            })
            .map_err(|_| RedisError::Connection("mock server gone".to_string()))?;
        Ok(Box::new(client))
    }
}

/// Hands out sockets that never answer and fail every write
pub struct BrokenConnector;

#[async_trait]
impl Connector for BrokenConnector {
    async fn connect(&self, _config: &ConnectionConfig) -> RedisResult<BoxedStream> {
        init_tracing();
        Ok(Box::new(BrokenPipe))
    }
}

struct BrokenPipe;

impl AsyncRead for BrokenPipe {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for BrokenPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Server ends of the connections opened so far
pub struct Accepts(Mutex<mpsc::UnboundedReceiver<MockServer>>);

impl Accepts {
    pub async fn next(&self) -> MockServer {
        tokio::time::timeout(WAIT, self.0.lock().await.recv())
            .await
            .expect("no connection was opened")
            .expect("connector dropped")
    }

    pub async fn none_within(&self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.0.lock().await.recv())
            .await
            .is_err()
    }
}

pub struct MockServer {
    stream: DuplexStream,
    decoder: RespDecoder,
}

impl MockServer {
    /// Next command as strings, or `None` once the client hung up
    pub async fn read_command(&mut self) -> Option<Vec<String>> {
        loop {
            if let Some(value) = self.decoder.decode().expect("client sent invalid RESP") {
                return Some(command_strings(value));
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            self.decoder.feed(&chunk[..n]);
        }
    }

    pub async fn expect(&mut self, args: &[&str]) {
        let command = tokio::time::timeout(WAIT, self.read_command())
            .await
            .expect("timed out waiting for a command")
            .expect("client hung up");
        assert_eq!(command, args);
    }

    /// True if nothing arrives for `wait`
    pub async fn silent_for(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.read_command()).await.is_err()
    }

    /// True if the client closes its end within a few seconds
    pub async fn hung_up(&mut self) -> bool {
        matches!(tokio::time::timeout(WAIT, self.read_command()).await, Ok(None))
    }

    pub async fn reply(&mut self, raw: &[u8]) {
        self.stream.write_all(raw).await.expect("client went away");
    }

    pub async fn ok(&mut self) {
        self.reply(b"+OK\r\n").await;
    }

    /// Write an array of bulk strings, as used for pub/sub pushes
    pub async fn push(&mut self, parts: &[&str]) {
        self.reply(&bulk_array(parts)).await;
    }

    /// Write a (un)subscribe confirmation
    pub async fn ack(&mut self, kind: &str, name: &str, count: i64) {
        let mut frame = format!("*3\r\n${}\r\n{}\r\n${}\r\n{}\r\n", kind.len(), kind, name.len(), name);
        frame.push_str(&format!(":{count}\r\n"));
        self.reply(frame.as_bytes()).await;
    }
}

pub fn bulk_array(parts: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len());
    for part in parts {
        out.push_str(&format!("${}\r\n{}\r\n", part.len(), part));
    }
    out.into_bytes()
}

fn command_strings(value: RespValue) -> Vec<String> {
    match value {
        RespValue::Array(items) => items
            .into_iter()
            .map(|item| item.as_string().expect("command argument"))
            .collect(),
        other => panic!("expected a command array, got {other:?}"),
    }
}
