//! # Connection Watchdog
//!
//! Purpose: Own the transport of one logical connection, pump commands and
//! replies while it is up, and decide what happens when it goes away.
//!
//! ## Design Principles
//! 1. **One Task per Connection**: A single tokio task runs the read and
//!    write halves and all reconnect attempts, so attempts never overlap.
//! 2. **Observable State**: Every transition is published through a
//!    `watch` channel; `Closed` is terminal and cannot be overwritten.
//! 3. **Policy at the Edges**: Backoff, suspension and cancel-on-failure are
//!    read from the connection's own options snapshot.
//! 4. **Replay After Loss**: Commands written to a dead transport are sent
//!    again, in order, on the next one. The command whose reply failed to
//!    decode is failed instead, and backoff keeps growing while transports
//!    keep dying that way.
//!
//! ## State Machine
//!
//! ```text
//!             ┌────────── unexpected drop ──────────┐
//!             ▼                                     │
//! Reconnecting ─► Connecting ─► Activating ─► Connected ─► (QUIT) ─► Disconnected
//!      ▲  │                         │                                   │
//!      │  └─ suspended ─► Suspended │ failure                           │ resume
//!      └────────── resume ─┘ ◄──────┘                                   ▼
//!                                                               Reconnecting
//! any state ── close() ──► Closed
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Notify};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pkv_common::{RespCodec, RespError};

use crate::connection::Core;
use crate::endpoint::Endpoint;
use crate::error::{ClientError, StateError};
use crate::options::ClientOptions;
use crate::transport::{self, Transport, TransportInfo};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Opening the TCP stream.
    Connecting,
    /// Running the activation handshake.
    Activating,
    /// Transport up; commands flow.
    Connected,
    /// Transport gone; no reconnect is running until resumed (or ever).
    Disconnected,
    /// Waiting for or running reconnect attempts.
    Reconnecting,
    /// Reconnects paused; commands queue until resumed or closed.
    Suspended,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Activating => "activating",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Reconnect state shared between the watchdog task and the facade.
pub(crate) struct Watchdog {
    options: ClientOptions,
    endpoint: Endpoint,
    state: watch::Sender<ConnectionState>,
    transport: Mutex<Option<TransportInfo>>,
    suspended: AtomicBool,
    // Set by the QUIT reply decoder once the server acknowledged it.
    quit_acknowledged: Arc<AtomicBool>,
    resume: Notify,
    shutdown: CancellationToken,
}

impl Watchdog {
    pub(crate) fn new(options: ClientOptions, endpoint: Endpoint) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Watchdog {
            options,
            endpoint,
            state,
            transport: Mutex::new(None),
            suspended: AtomicBool::new(false),
            quit_acknowledged: Arc::new(AtomicBool::new(false)),
            resume: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn transport(&self) -> Option<TransportInfo> {
        *self.transport.lock()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if current.is_closed() || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!(endpoint = %self.endpoint, state = %next, "connection state changed");
        }
    }

    /// Records a freshly activated transport and marks the connection usable.
    pub(crate) fn transport_established(&self, info: TransportInfo) {
        *self.transport.lock() = Some(info);
        self.set_state(ConnectionState::Connected);
    }

    /// Switches to `Closed` and stops the task. Returns the state the
    /// connection was in, or `None` if it was already closed.
    pub(crate) fn shutdown(&self) -> Option<ConnectionState> {
        let mut previous = None;
        self.state.send_if_modified(|current| {
            if current.is_closed() {
                return false;
            }
            previous = Some(*current);
            *current = ConnectionState::Closed;
            true
        });
        self.shutdown.cancel();
        *self.transport.lock() = None;
        previous
    }

    pub(crate) fn is_reconnect_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn suspend_reconnect(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub(crate) fn resume_reconnect(&self) {
        self.suspended.store(false, Ordering::Release);
        if matches!(
            self.state(),
            ConnectionState::Suspended | ConnectionState::Disconnected | ConnectionState::Reconnecting
        ) {
            self.resume.notify_one();
        }
    }

    /// Flag a QUIT decoder raises when the server answered the QUIT.
    pub(crate) fn quit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.quit_acknowledged)
    }

    fn take_quit_acknowledgement(&self) -> bool {
        self.quit_acknowledged.swap(false, Ordering::AcqRel)
    }

    /// Waits for `resume_reconnect`. Returns false on shutdown.
    async fn wait_for_resume(&self) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = self.resume.notified() => {
                    if !self.is_reconnect_suspended() {
                        return true;
                    }
                }
            }
        }
    }
}

/// How a transport stopped serving.
enum TransportEnd {
    Shutdown,
    Quit,
    Dropped(Option<ClientError>),
}

/// Drives a connection from its first transport until it is closed.
pub(crate) async fn run(core: Arc<Core>, initial: Transport) {
    let watchdog = &core.watchdog;
    let options = watchdog.options().clone();
    let mut next = Some(initial);
    let mut attempt: u32 = 0;
    // Consecutive transports lost to undecodable replies.
    let mut protocol_drops: u32 = 0;
    let mut immediate = false;

    loop {
        if let Some(transport) = next.take() {
            watchdog.transport_established(transport.info);
            core.notify_connected();

            let end = serve(&core, transport).await;
            *watchdog.transport.lock() = None;
            // Any way the transport ends after an acknowledged QUIT is deliberate.
            let end = match end {
                TransportEnd::Dropped(_) if watchdog.take_quit_acknowledgement() => {
                    TransportEnd::Quit
                }
                end => end,
            };

            match end {
                TransportEnd::Shutdown => break,
                TransportEnd::Quit => {
                    info!(endpoint = %watchdog.endpoint, "connection closed by QUIT");
                    core.dispatcher.transport_lost();
                    core.notify_disconnected();
                    if !options.auto_reconnect {
                        core.dispatcher.reject(StateError::DisconnectedReconnectDisabled);
                        watchdog.set_state(ConnectionState::Disconnected);
                        watchdog.shutdown.cancelled().await;
                        break;
                    }
                    watchdog.set_state(ConnectionState::Disconnected);
                    if !watchdog.wait_for_resume().await {
                        break;
                    }
                    immediate = true;
                    attempt = 0;
                    protocol_drops = 0;
                }
                TransportEnd::Dropped(error) => {
                    let requeued = core.dispatcher.transport_lost();
                    match &error {
                        Some(error) => {
                            warn!(endpoint = %watchdog.endpoint, %error, requeued, "transport failed");
                            core.notify_exception(error);
                        }
                        None => {
                            warn!(endpoint = %watchdog.endpoint, requeued, "transport closed by peer");
                        }
                    }
                    core.notify_disconnected();

                    if !options.auto_reconnect {
                        core.dispatcher.reject(StateError::DisconnectedReconnectDisabled);
                        watchdog.set_state(ConnectionState::Disconnected);
                        watchdog.shutdown.cancelled().await;
                        break;
                    }
                    watchdog.set_state(ConnectionState::Reconnecting);
                    if error.as_ref().is_some_and(ClientError::is_protocol) {
                        protocol_drops = protocol_drops.saturating_add(1);
                    } else {
                        protocol_drops = 0;
                    }
                    attempt = protocol_drops;
                }
            }
        }

        if watchdog.is_reconnect_suspended() {
            watchdog.set_state(ConnectionState::Suspended);
            info!(endpoint = %watchdog.endpoint, "reconnect suspended");
            if !watchdog.wait_for_resume().await {
                break;
            }
            watchdog.set_state(ConnectionState::Reconnecting);
        } else if !immediate {
            let delay = options.reconnect_delay.delay_for(attempt);
            debug!(endpoint = %watchdog.endpoint, attempt, ?delay, "waiting before reconnect");
            tokio::select! {
                _ = watchdog.shutdown.cancelled() => break,
                _ = watchdog.resume.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            if watchdog.is_reconnect_suspended() {
                continue;
            }
        }
        immediate = false;

        watchdog.set_state(ConnectionState::Connecting);
        let result = tokio::select! {
            _ = watchdog.shutdown.cancelled() => break,
            result = transport::connect(&watchdog.endpoint, &options, || {
                watchdog.set_state(ConnectionState::Activating)
            }) => result,
        };

        match result {
            Ok(transport) => {
                info!(
                    endpoint = %watchdog.endpoint,
                    transport = transport.info.id,
                    attempts = attempt.saturating_add(1),
                    "reconnected"
                );
                attempt = 0;
                next = Some(transport);
            }
            Err(error) => {
                attempt = attempt.saturating_add(1);
                warn!(endpoint = %watchdog.endpoint, %error, attempt, "reconnect attempt failed");
                core.notify_exception(&error);

                if options.cancel_commands_on_reconnect_failure {
                    let cancelled = core.dispatcher.reset();
                    if cancelled > 0 {
                        info!(
                            endpoint = %watchdog.endpoint,
                            cancelled,
                            "cancelled queued commands after failed reconnect"
                        );
                    }
                }
                if error.is_protocol() && options.suspend_reconnect_on_protocol_failure {
                    watchdog.suspend_reconnect();
                }
                watchdog.set_state(ConnectionState::Reconnecting);
            }
        }
    }

    *watchdog.transport.lock() = None;
    debug!(endpoint = %watchdog.endpoint, "watchdog stopped");
}

/// Pumps commands out and replies in until the transport ends.
async fn serve(core: &Core, transport: Transport) -> TransportEnd {
    let Transport { stream, read_buf, info } = transport;
    let (reader, mut writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, RespCodec::new());
    frames.read_buffer_mut().extend_from_slice(&read_buf);

    let read_loop = async {
        loop {
            match frames.next().await {
                Some(Ok(reply)) => core.dispatcher.complete_next(reply),
                Some(Err(RespError::Io(err))) => return TransportEnd::Dropped(Some(err.into())),
                Some(Err(err)) => {
                    // The broken frame was the reply to the oldest written command.
                    core.dispatcher.fail_next(ClientError::Protocol(err.clone()));
                    return TransportEnd::Dropped(Some(ClientError::Protocol(err)));
                }
                None => return TransportEnd::Dropped(None),
            }
        }
    };

    let write_loop = async {
        let mut out = BytesMut::with_capacity(8 * 1024);
        loop {
            if core.dispatcher.drain_writes(&mut out) > 0 {
                if let Err(err) = writer.write_all(&out).await {
                    return TransportEnd::Dropped(Some(err.into()));
                }
                out.clear();
            }
            core.dispatcher.writable().await;
        }
    };

    let end = tokio::select! {
        _ = core.watchdog.shutdown.cancelled() => TransportEnd::Shutdown,
        end = read_loop => end,
        end = write_loop => end,
    };

    if matches!(end, TransportEnd::Shutdown) {
        let _ = writer.shutdown().await;
    }
    debug!(transport = info.id, "transport released");
    end
}
