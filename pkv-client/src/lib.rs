//! # PipeKV Async Client
//!
//! Purpose: Pipelined RESP2 client for Redis-compatible key-value servers,
//! built around one long-lived logical connection that outlives its TCP
//! transports.
//!
//! ## Design Principles
//! 1. **Pipelining**: Commands are written as soon as they are admitted and
//!    replies are matched strictly in submission order.
//! 2. **Self-Healing**: A per-connection watchdog reconnects with bounded
//!    exponential backoff and replays commands the old transport swallowed.
//! 3. **Backpressure**: A bounded request queue rejects work synchronously
//!    instead of buffering without limit.
//! 4. **One Connection, Three Views**: Blocking, future-based and stream-based
//!    APIs all drive the same connection.
//!
//! ## Quick Start
//!
//! ```no_run
//! # async fn demo() -> pkv_client::ClientResult<()> {
//! use pkv_client::Client;
//!
//! let client = Client::from_uri("kv://127.0.0.1:6379")?;
//! let connection = client.connect().await?;
//! let commands = connection.async_view();
//! commands.set("greeting", "hello")?.await?;
//! let value = commands.get("greeting")?.await?;
//! assert_eq!(value.as_deref(), Some(&b"hello"[..]));
//! # Ok(())
//! # }
//! ```

mod client;
mod command;
pub mod commands;
mod connection;
mod dispatcher;
mod endpoint;
mod error;
mod listener;
mod options;
mod transport;
mod view;
mod watchdog;

pub use client::Client;
pub use command::{output, Command, CommandFuture, CommandState};
pub use connection::StatefulConnection;
pub use dispatcher::Dispatcher;
pub use endpoint::{Endpoint, DEFAULT_PORT, DEFAULT_TIMEOUT};
pub use error::{ClientError, ClientResult, StateError};
pub use listener::{ConnectionListener, ListenerId, ListenerRegistry};
pub use options::{ClientOptions, ReconnectDelay};
pub use transport::TransportInfo;
pub use view::{AsyncConnection, PushConnection, SyncConnection};
pub use watchdog::ConnectionState;

pub use pkv_common::{Request, RespError, RespValue};
