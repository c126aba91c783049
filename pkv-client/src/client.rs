//! # Client Entry Point
//!
//! Purpose: Hold the defaults new connections start from (endpoint, options,
//! listeners) and open `StatefulConnection`s.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides transport setup and watchdog startup.
//! 2. **Snapshot Options**: Each connection copies the options current at
//!    connect time; later `set_options` calls do not reach it.
//! 3. **Shared Listeners**: One registry serves every connection the client
//!    opens, so a listener added later still sees events of older connections.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::connection::StatefulConnection;
use crate::endpoint::Endpoint;
use crate::error::{ClientError, ClientResult};
use crate::listener::{ConnectionListener, ListenerId, ListenerRegistry};
use crate::options::ClientOptions;
use crate::transport;

/// Factory for stateful connections.
pub struct Client {
    endpoint: Option<Endpoint>,
    options: RwLock<ClientOptions>,
    listeners: Arc<ListenerRegistry>,
}

impl Client {
    /// Creates a client whose `connect` targets `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        Client {
            endpoint: Some(endpoint),
            options: RwLock::new(ClientOptions::default()),
            listeners: Arc::new(ListenerRegistry::new()),
        }
    }

    /// Creates a client without a default endpoint; use `connect_to`.
    pub fn without_endpoint() -> Self {
        Client {
            endpoint: None,
            options: RwLock::new(ClientOptions::default()),
            listeners: Arc::new(ListenerRegistry::new()),
        }
    }

    /// Creates a client from a `kv://` URI.
    pub fn from_uri(uri: &str) -> ClientResult<Self> {
        Endpoint::parse(uri).map(Client::new)
    }

    /// Replaces the options used by connections opened from now on.
    pub fn with_options(self, options: ClientOptions) -> Self {
        self.set_options(options);
        self
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn options(&self) -> ClientOptions {
        self.options.read().clone()
    }

    pub fn set_options(&self, options: ClientOptions) {
        *self.options.write() = options;
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Connects to the default endpoint.
    pub async fn connect(&self) -> ClientResult<StatefulConnection> {
        let endpoint = self.endpoint.as_ref().ok_or_else(|| {
            ClientError::InvalidEndpoint("client has no default endpoint; use connect_to".to_string())
        })?;
        self.connect_to(endpoint).await
    }

    /// Connects to `endpoint`.
    ///
    /// Must run inside a tokio runtime; the connection's watchdog is spawned
    /// on that runtime. Failures of this initial connect are returned as is;
    /// the watchdog only takes over once a transport is established.
    pub async fn connect_to(&self, endpoint: &Endpoint) -> ClientResult<StatefulConnection> {
        let options = self.options();
        let transport = match transport::connect(endpoint, &options, || {}).await {
            Ok(transport) => transport,
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "connect failed");
                return Err(err);
            }
        };
        info!(endpoint = %endpoint, transport = transport.info.id, "connected");

        Ok(StatefulConnection::start(
            options,
            endpoint.clone(),
            Arc::clone(&self.listeners),
            Handle::current(),
            transport,
        ))
    }
}

impl Default for Client {
    fn default() -> Self {
        Client::without_endpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_without_endpoint_is_rejected() {
        let client = Client::default();
        match client.connect().await {
            Err(ClientError::InvalidEndpoint(message)) => assert!(message.contains("endpoint")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn options_are_copied_out() {
        let client = Client::from_uri("kv://localhost").unwrap();
        let mut options = client.options();
        options.auto_reconnect = false;
        assert!(client.options().auto_reconnect);

        client.set_options(options);
        assert!(!client.options().auto_reconnect);
    }
}
