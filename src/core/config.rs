//! Configuration types for Redis connections

use crate::core::error::{RedisError, RedisResult};
use percent_encoding::percent_decode_str;
use std::sync::Arc;
use std::time::Duration;

/// Default Redis port
pub const DEFAULT_PORT: u16 = 6379;

/// Configuration for a Redis connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server host name or IP address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Optional ACL user name, sent as the first AUTH argument
    pub username: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,

    /// Database number; anything other than 0 triggers a SELECT on connect
    pub database: u32,

    /// Wrap the socket in TLS
    pub tls: bool,

    /// Custom rustls client configuration (defaults to webpki roots)
    pub tls_config: Option<Arc<rustls::ClientConfig>>,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Enable TCP keepalive
    pub tcp_keepalive: Option<Duration>,

    /// Initial capacity of the read buffer
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            database: 0,
            tls: false,
            tls_config: None,
            connect_timeout: Duration::from_secs(5),
            tcp_keepalive: Some(Duration::from_secs(60)),
            read_buffer_size: 8192,
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration for the given host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Parse a `redis://[user[:password]@]host[:port][/db]` URL
    ///
    /// `rediss://` enables TLS.
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Config`] for malformed URLs, unsupported
    /// schemes, non-UTF-8 credentials or a non-numeric database.
    pub fn from_url(input: &str) -> RedisResult<Self> {
        let url = url::Url::parse(input)
            .map_err(|e| RedisError::Config(format!("Invalid URL {input}: {e}")))?;

        let tls = match url.scheme() {
            "redis" => false,
            "rediss" => true,
            other => {
                return Err(RedisError::Config(format!(
                    "Unsupported URL scheme: {other}"
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RedisError::Config(format!("Missing host in {input}")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let username = match url.username() {
            "" => None,
            name => Some(decode_component(name, "Username")?),
        };
        let password = url
            .password()
            .map(|pw| decode_component(pw, "Password"))
            .transpose()?;

        let database = match url.path().trim_matches('/') {
            "" => 0,
            db => db
                .parse::<u32>()
                .map_err(|_| RedisError::Config(format!("Invalid database number: {db}")))?,
        };

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            username,
            password,
            database,
            tls,
            ..Default::default()
        })
    }

    /// Set the password for authentication
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the ACL user name
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the database number
    #[must_use]
    pub const fn with_database(mut self, database: u32) -> Self {
        self.database = database;
        self
    }

    /// Enable or disable TLS
    #[must_use]
    pub const fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Use a custom rustls client configuration (implies TLS)
    #[must_use]
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = true;
        self.tls_config = Some(config);
        self
    }

    /// Set the connection timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set or disable TCP keepalive
    #[must_use]
    pub const fn with_tcp_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.tcp_keepalive = keepalive;
        self
    }

    /// Whether connecting requires an AUTH and/or SELECT exchange
    #[must_use]
    pub fn needs_handshake(&self) -> bool {
        self.password.is_some() || self.database != 0
    }

    /// `host:port` for logs and socket addresses
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for ConnectionConfig {
    type Err = RedisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_url(s)
    }
}

fn decode_component(raw: &str, what: &str) -> RedisResult<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| RedisError::Config(format!("{what} is not valid UTF-8")))
}
