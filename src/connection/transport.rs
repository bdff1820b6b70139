//! Byte-stream transports
//!
//! The connection core only needs something it can read from and write to.
//! [`TcpConnector`] is the default; tests and embedders plug in their own
//! [`Connector`].

use crate::core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// A bidirectional byte stream usable as a Redis transport
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens transport streams for a connection
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new stream to the server described by `config`
    async fn connect(&self, config: &ConnectionConfig) -> RedisResult<BoxedStream>;
}

/// Plain TCP, optionally wrapped in TLS
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, config: &ConnectionConfig) -> RedisResult<BoxedStream> {
        let addr = config.address();
        debug!("Connecting to Redis at {}", addr);

        let stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| RedisError::Timeout)?
            .map_err(|e| RedisError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;

        stream.set_nodelay(true)?;

        if let Some(keepalive_duration) = config.tcp_keepalive {
            let socket = socket2::SockRef::from(&stream);
            let keepalive = socket2::TcpKeepalive::new().with_time(keepalive_duration);
            socket.set_tcp_keepalive(&keepalive).map_err(|e| {
                RedisError::Connection(format!("Failed to set TCP keepalive: {}", e))
            })?;
        }

        if !config.tls {
            return Ok(Box::new(stream));
        }

        let client_config = config
            .tls_config
            .clone()
            .unwrap_or_else(default_tls_config);
        let server_name = ServerName::try_from(config.host.clone())
            .map_err(|e| RedisError::Tls(format!("Invalid server name {}: {}", config.host, e)))?;

        debug!("Starting TLS handshake with {}", addr);
        let tls = timeout(
            config.connect_timeout,
            TlsConnector::from(client_config).connect(server_name, stream),
        )
        .await
        .map_err(|_| RedisError::Timeout)?
        .map_err(|e| RedisError::Tls(format!("TLS handshake with {} failed: {}", addr, e)))?;

        Ok(Box::new(tls))
    }
}

/// Client configuration trusting the bundled webpki roots
fn default_tls_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}
