//! # Transport Establishment
//!
//! Purpose: Open a TCP stream to an endpoint and run the activation
//! handshake before the stream is handed to the watchdog.
//!
//! ## Activation Sequence
//!
//! ```text
//! resolve ─► connect (endpoint timeout) ─► AUTH? ─► SELECT? ─► PING? ─► usable
//! ```
//!
//! Every step shares the endpoint timeout. A reply that cannot be decoded
//! fails activation immediately with a protocol error, so a peer that does
//! not speak RESP is detected as soon as its first byte arrives.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use pkv_common::{Request, RespCodec, RespError, RespValue};

use crate::commands;
use crate::endpoint::Endpoint;
use crate::error::{ClientError, ClientResult};
use crate::options::ClientOptions;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one physical transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportInfo {
    /// Process-unique id; a reconnect always yields a new one.
    pub id: u64,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// An activated stream plus any reply bytes read past the handshake.
pub(crate) struct Transport {
    pub(crate) stream: TcpStream,
    pub(crate) read_buf: BytesMut,
    pub(crate) info: TransportInfo,
}

/// Connects to `endpoint` and activates the stream.
///
/// `on_activating` runs once the TCP connection is up, before the handshake.
pub(crate) async fn connect(
    endpoint: &Endpoint,
    options: &ClientOptions,
    on_activating: impl FnOnce(),
) -> ClientResult<Transport> {
    let timeout = endpoint.timeout();
    let addr = endpoint.resolve().await?;

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(connection_error(endpoint, source)),
        Err(_) => {
            return Err(connection_error(
                endpoint,
                io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            ))
        }
    };
    stream.set_nodelay(true)?;

    let info = TransportInfo {
        id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
        local_addr: stream.local_addr()?,
        peer_addr: stream.peer_addr()?,
    };
    debug!(endpoint = %endpoint, transport = info.id, "tcp connection established");

    on_activating();
    match tokio::time::timeout(timeout, activate(stream, endpoint, options, info)).await {
        Ok(result) => result,
        Err(_) => Err(connection_error(
            endpoint,
            io::Error::new(io::ErrorKind::TimedOut, "activation timed out"),
        )),
    }
}

async fn activate(
    stream: TcpStream,
    endpoint: &Endpoint,
    options: &ClientOptions,
    info: TransportInfo,
) -> ClientResult<Transport> {
    let mut framed = Framed::new(stream, RespCodec::new());

    if let Some(password) = endpoint.password() {
        let reply = round_trip(&mut framed, endpoint, &commands::auth(password)).await?;
        expect_ok("AUTH", reply)?;
    }

    if let Some(database) = endpoint.database() {
        let reply = round_trip(&mut framed, endpoint, &commands::select(database)).await?;
        expect_ok("SELECT", reply)?;
    }

    if options.ping_before_activate_connection {
        let reply = round_trip(&mut framed, endpoint, &commands::ping()).await?;
        match reply {
            RespValue::Simple(ref text) if text.eq_ignore_ascii_case(b"PONG") => {}
            RespValue::Error(message) => return Err(server_error(&message)),
            other => {
                return Err(RespError::Unexpected(format!(
                    "PING answered with {} reply",
                    other.kind()
                ))
                .into())
            }
        }
        debug!(endpoint = %endpoint, transport = info.id, "activation ping succeeded");
    }

    let parts = framed.into_parts();
    Ok(Transport {
        stream: parts.io,
        read_buf: parts.read_buf,
        info,
    })
}

async fn round_trip(
    framed: &mut Framed<TcpStream, RespCodec>,
    endpoint: &Endpoint,
    request: &Request,
) -> ClientResult<RespValue> {
    framed
        .send(request)
        .await
        .map_err(|err| activation_error(endpoint, err))?;

    match framed.next().await {
        Some(Ok(reply)) => Ok(reply),
        Some(Err(err)) => Err(activation_error(endpoint, err)),
        None => Err(connection_error(
            endpoint,
            io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed during activation"),
        )),
    }
}

fn expect_ok(step: &str, reply: RespValue) -> ClientResult<()> {
    match reply {
        RespValue::Simple(ref text) if text.eq_ignore_ascii_case(b"OK") => Ok(()),
        RespValue::Error(message) => Err(server_error(&message)),
        other => Err(RespError::Unexpected(format!("{step} answered with {} reply", other.kind())).into()),
    }
}

fn server_error(message: &[u8]) -> ClientError {
    ClientError::Server(String::from_utf8_lossy(message).into_owned())
}

fn activation_error(endpoint: &Endpoint, err: RespError) -> ClientError {
    match err {
        RespError::Io(source) => connection_error(endpoint, source),
        other => ClientError::Protocol(other),
    }
}

fn connection_error(endpoint: &Endpoint, source: io::Error) -> ClientError {
    ClientError::Connection {
        endpoint: endpoint.to_string(),
        source,
    }
}
