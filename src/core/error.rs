//! Error types for Redis operations

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type for Redis operations
pub type RedisResult<T> = Result<T, RedisError>;

/// Comprehensive error type for Redis operations
///
/// Errors are `Clone` so that a single terminal cause can be delivered to
/// every request still waiting on a connection when it goes down.
#[derive(Error, Debug, Clone)]
pub enum RedisError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// Protocol parsing error or broken reply framing
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned an error reply
    #[error("Server error: {0}")]
    Server(String),

    /// Connection could not be established
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection was closed while the request was outstanding
    #[error("Connection closed: {reason}")]
    Closed {
        /// Why the connection went away
        reason: String,
    },

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Type conversion error
    #[error("Type conversion error: {0}")]
    Type(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Unexpected response from server
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<io::Error> for RedisError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl RedisError {
    /// Build a [`RedisError::Closed`] from an optional underlying cause
    #[must_use]
    pub fn closed(cause: Option<&Self>) -> Self {
        match cause {
            Some(Self::Closed { reason }) => Self::Closed {
                reason: reason.clone(),
            },
            Some(err) => Self::Closed {
                reason: err.to_string(),
            },
            None => Self::Closed {
                reason: "connection closed by client".to_string(),
            },
        }
    }

    /// Whether this error tears down the connection it happened on
    ///
    /// Server replies and conversion failures only affect a single request.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Server(_) | Self::Type(_) | Self::UnexpectedResponse(_) | Self::Config(_)
        )
    }

    /// Check if this error came from a `-ERR ...` style reply
    #[must_use]
    pub const fn is_server_error(&self) -> bool {
        matches!(self, Self::Server(_))
    }
}
