//! # Stateful Connection
//!
//! Purpose: The long-lived handle applications hold. It submits commands,
//! exposes lifecycle controls, and hands out the sync, async and push views.
//!
//! ## Design Principles
//! 1. **Cheap Clones**: `StatefulConnection` is an `Arc` handle; every clone
//!    and every view refers to the same underlying connection.
//! 2. **Close on Last Drop**: When the final handle goes away the connection
//!    is closed and its watchdog task stops.
//! 3. **Listeners Get the Facade**: Listener callbacks receive the same
//!    `StatefulConnection` the application holds, so identity checks work.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info};

use pkv_common::{Request, RespValue};

use crate::command::{output, Command, CommandFuture};
use crate::commands;
use crate::dispatcher::Dispatcher;
use crate::endpoint::Endpoint;
use crate::error::{ClientError, ClientResult};
use crate::listener::ListenerRegistry;
use crate::options::ClientOptions;
use crate::transport::{Transport, TransportInfo};
use crate::view::{AsyncConnection, PushConnection, SyncConnection};
use crate::watchdog::{self, ConnectionState, Watchdog};

/// State shared by the facade and the watchdog task.
pub(crate) struct Core {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) watchdog: Watchdog,
    listeners: Arc<ListenerRegistry>,
    owner: Weak<ConnectionInner>,
}

impl Core {
    fn connection(&self) -> Option<StatefulConnection> {
        self.owner.upgrade().map(|inner| StatefulConnection { inner })
    }

    pub(crate) fn notify_connected(&self) {
        if let Some(connection) = self.connection() {
            self.listeners.fire_connected(&connection);
        }
    }

    pub(crate) fn notify_disconnected(&self) {
        if let Some(connection) = self.connection() {
            self.listeners.fire_disconnected(&connection);
        }
    }

    pub(crate) fn notify_exception(&self, error: &ClientError) {
        if let Some(connection) = self.connection() {
            self.listeners.fire_exception(&connection, error);
        }
    }
}

struct ConnectionInner {
    core: Arc<Core>,
    runtime: Handle,
    timeout: Mutex<Option<Duration>>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        let cancelled = self.core.dispatcher.close();
        if self.core.watchdog.shutdown().is_some() {
            debug!(endpoint = %self.core.watchdog.endpoint(), cancelled, "connection dropped");
        }
    }
}

/// A logical connection that survives transport loss.
#[derive(Clone)]
pub struct StatefulConnection {
    inner: Arc<ConnectionInner>,
}

impl StatefulConnection {
    /// Wraps an activated transport and starts the watchdog task.
    pub(crate) fn start(
        options: ClientOptions,
        endpoint: Endpoint,
        listeners: Arc<ListenerRegistry>,
        runtime: Handle,
        transport: Transport,
    ) -> Self {
        let timeout = Some(endpoint.timeout());
        let limit = options.request_queue_size;
        let inner = Arc::new_cyclic(|owner| ConnectionInner {
            core: Arc::new(Core {
                dispatcher: Dispatcher::new(limit),
                watchdog: Watchdog::new(options, endpoint),
                listeners,
                owner: owner.clone(),
            }),
            runtime: runtime.clone(),
            timeout: Mutex::new(timeout),
        });

        let core = Arc::clone(&inner.core);
        core.watchdog.transport_established(transport.info);
        runtime.spawn(watchdog::run(core, transport));
        StatefulConnection { inner }
    }

    fn core(&self) -> &Core {
        &self.inner.core
    }

    /// Submits a request and returns the future for its decoded reply.
    ///
    /// Fails immediately when the queue is full, the connection is closed, or
    /// it is disconnected with reconnect disabled.
    pub fn submit<T, F>(&self, request: Request, decoder: F) -> ClientResult<CommandFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(RespValue) -> ClientResult<T> + Send + 'static,
    {
        let (command, future) = Command::new(request, decoder);
        self.core().dispatcher.submit(command)?;
        Ok(future)
    }

    /// Cancels every queued and in-flight command. The connection stays open.
    pub fn reset(&self) -> usize {
        let cancelled = self.core().dispatcher.reset();
        debug!(endpoint = %self.endpoint(), cancelled, "connection reset");
        cancelled
    }

    /// Cancels all pending commands and closes the connection for good.
    pub fn close(&self) {
        let core = self.core();
        let cancelled = core.dispatcher.close();
        match core.watchdog.shutdown() {
            Some(previous) => {
                info!(endpoint = %self.endpoint(), cancelled, "connection closed");
                if previous == ConnectionState::Connected {
                    core.listeners.fire_disconnected(self);
                }
            }
            None => debug!(endpoint = %self.endpoint(), "close on closed connection"),
        }
    }

    /// Sends QUIT. Once the server acknowledges it, the transport closing
    /// is treated as a deliberate disconnect: no automatic reconnect until
    /// `resume_reconnect` is called. A drop before the acknowledgement is
    /// handled like any other transport loss.
    pub fn quit(&self) -> ClientResult<CommandFuture<String>> {
        let acknowledged = self.core().watchdog.quit_flag();
        self.submit(commands::quit(), move |reply| {
            let status = output::status(reply)?;
            acknowledged.store(true, Ordering::Release);
            Ok(status)
        })
    }

    /// The options snapshot taken when this connection was created.
    pub fn options(&self) -> &ClientOptions {
        self.core().watchdog.options()
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.core().watchdog.endpoint()
    }

    pub fn state(&self) -> ConnectionState {
        self.core().watchdog.state()
    }

    /// Subscribes to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.core().watchdog.subscribe()
    }

    /// True while a transport is up.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The current transport, if connected.
    pub fn transport(&self) -> Option<TransportInfo> {
        self.core().watchdog.transport()
    }

    /// Queued plus in-flight commands.
    pub fn pending_commands(&self) -> usize {
        self.core().dispatcher.depth()
    }

    pub fn is_reconnect_suspended(&self) -> bool {
        self.core().watchdog.is_reconnect_suspended()
    }

    /// Pauses automatic reconnects; takes effect at the next attempt.
    pub fn suspend_reconnect(&self) {
        self.core().watchdog.suspend_reconnect();
    }

    /// Lifts a suspension (or a QUIT disconnect) and reconnects right away.
    pub fn resume_reconnect(&self) {
        self.core().watchdog.resume_reconnect();
    }

    /// Timeout applied by the sync view; `None` waits forever.
    pub fn timeout(&self) -> Option<Duration> {
        *self.inner.timeout.lock()
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *self.inner.timeout.lock() = timeout;
    }

    pub fn sync_view(&self) -> SyncConnection {
        SyncConnection::new(self.clone())
    }

    pub fn async_view(&self) -> AsyncConnection {
        AsyncConnection::new(self.clone())
    }

    pub fn push_view(&self) -> PushConnection {
        PushConnection::new(self.clone())
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Returns true when both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &StatefulConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for StatefulConnection {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for StatefulConnection {}

impl fmt::Debug for StatefulConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatefulConnection")
            .field("endpoint", self.endpoint())
            .field("state", &self.state())
            .field("pending", &self.pending_commands())
            .finish()
    }
}
