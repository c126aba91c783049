//! # Endpoint Descriptor
//!
//! Purpose: Describe where a connection goes (host, port, credentials,
//! database, timeout) and cache the resolved socket address.
//!
//! ## Design Principles
//! 1. **Shared Handle**: Clones refer to the same descriptor, so a watchdog
//!    reconnecting later sees host/port changes made through any clone.
//! 2. **Cache Invalidation**: Mutating host or port drops the cached address;
//!    a resolution racing with a mutation never caches the stale result.
//! 3. **Secrets Stay Quiet**: `Debug` and `Display` never print the password.
//!
//! ## URI Form
//!
//! ```text
//! kv://[:password@]host[:port][/database][?timeout_ms=N]
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::error::{ClientError, ClientResult};

/// Default server port.
pub const DEFAULT_PORT: u16 = 6379;

/// Default connect/command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct Settings {
    host: String,
    port: u16,
    timeout: Duration,
    password: Option<String>,
    database: Option<u32>,
    // Bumped whenever host or port changes.
    generation: u64,
    resolved: Option<SocketAddr>,
}

/// Connection target shared between a client and its connections.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<RwLock<Settings>>,
}

impl Endpoint {
    /// Creates an endpoint with the default timeout and no credentials.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            inner: Arc::new(RwLock::new(Settings {
                host: host.into(),
                port,
                timeout: DEFAULT_TIMEOUT,
                password: None,
                database: None,
                generation: 0,
                resolved: None,
            })),
        }
    }

    /// Parses a `kv://` (or `redis://`) URI.
    pub fn parse(uri: &str) -> ClientResult<Self> {
        let url = Url::parse(uri).map_err(|err| ClientError::InvalidEndpoint(format!("{uri}: {err}")))?;
        if !matches!(url.scheme(), "kv" | "redis") {
            return Err(ClientError::InvalidEndpoint(format!(
                "unsupported scheme {:?}",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ClientError::InvalidEndpoint(format!("{uri}: missing host")))?;
        let endpoint = Endpoint::new(host, url.port().unwrap_or(DEFAULT_PORT));

        if let Some(password) = url.password() {
            endpoint.set_password(Some(password.to_string()));
        }

        let path = url.path().trim_start_matches('/');
        if !path.is_empty() {
            let database = path
                .parse::<u32>()
                .map_err(|_| ClientError::InvalidEndpoint(format!("{uri}: invalid database {path:?}")))?;
            endpoint.set_database(Some(database));
        }

        for (key, value) in url.query_pairs() {
            if key == "timeout_ms" {
                let millis = value
                    .parse::<u64>()
                    .map_err(|_| ClientError::InvalidEndpoint(format!("{uri}: invalid timeout {value:?}")))?;
                endpoint.set_timeout(Duration::from_millis(millis));
            }
        }

        Ok(endpoint)
    }

    /// Sets the timeout, builder style.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    /// Sets the password sent with AUTH during activation, builder style.
    pub fn with_password(self, password: impl Into<String>) -> Self {
        self.set_password(Some(password.into()));
        self
    }

    /// Sets the database selected during activation, builder style.
    pub fn with_database(self, database: u32) -> Self {
        self.set_database(Some(database));
        self
    }

    pub fn host(&self) -> String {
        self.inner.read().host.clone()
    }

    pub fn port(&self) -> u16 {
        self.inner.read().port
    }

    pub fn timeout(&self) -> Duration {
        self.inner.read().timeout
    }

    pub fn password(&self) -> Option<String> {
        self.inner.read().password.clone()
    }

    pub fn database(&self) -> Option<u32> {
        self.inner.read().database
    }

    /// Changes the host and invalidates the cached address.
    pub fn set_host(&self, host: impl Into<String>) {
        let mut settings = self.inner.write();
        settings.host = host.into();
        invalidate(&mut settings);
    }

    /// Changes the port and invalidates the cached address.
    pub fn set_port(&self, port: u16) {
        let mut settings = self.inner.write();
        settings.port = port;
        invalidate(&mut settings);
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.write().timeout = timeout;
    }

    pub fn set_password(&self, password: Option<String>) {
        self.inner.write().password = password;
    }

    pub fn set_database(&self, database: Option<u32>) {
        self.inner.write().database = database;
    }

    /// Returns the cached resolved address, if any.
    pub fn cached_address(&self) -> Option<SocketAddr> {
        self.inner.read().resolved
    }

    /// Forgets the cached address so the next connect resolves again.
    pub fn invalidate(&self) {
        invalidate(&mut self.inner.write());
    }

    /// Returns true when both handles share the same descriptor.
    pub fn ptr_eq(&self, other: &Endpoint) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves host and port, reusing the cached address when valid.
    pub async fn resolve(&self) -> ClientResult<SocketAddr> {
        let (host, port, generation) = {
            let settings = self.inner.read();
            if let Some(addr) = settings.resolved {
                return Ok(addr);
            }
            (settings.host.clone(), settings.port, settings.generation)
        };

        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|source| ClientError::Connection {
                endpoint: format!("{host}:{port}"),
                source,
            })?
            .next()
            .ok_or_else(|| ClientError::Connection {
                endpoint: format!("{host}:{port}"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
            })?;

        let mut settings = self.inner.write();
        if settings.generation == generation {
            settings.resolved = Some(addr);
        }
        Ok(addr)
    }
}

fn invalidate(settings: &mut Settings) {
    settings.generation = settings.generation.wrapping_add(1);
    settings.resolved = None;
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settings = self.inner.read();
        write!(f, "{}:{}", settings.host, settings.port)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settings = self.inner.read();
        f.debug_struct("Endpoint")
            .field("host", &settings.host)
            .field("port", &settings.port)
            .field("timeout", &settings.timeout)
            .field("password", &settings.password.as_ref().map(|_| "***"))
            .field("database", &settings.database)
            .finish()
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> ClientResult<Self> {
        Endpoint::parse(s)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let uri = String::deserialize(deserializer)?;
        Endpoint::parse(&uri).map_err(serde::de::Error::custom)
    }
}
