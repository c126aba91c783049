//! # Client Errors
//!
//! Every outcome a caller can observe besides success. Errors that belong to
//! one command (server replies, cancellation, caller timeouts) are kept apart
//! from transport-level faults so callers can tell "the server said no" from
//! "the connection is broken".

use std::io;
use std::time::Duration;

use thiserror::Error;

use pkv_common::RespError;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport could not be established (DNS, refused, timeout).
    #[error("unable to connect to {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    /// Malformed or unrecognized reply frame, including activation checks.
    #[error(transparent)]
    Protocol(#[from] RespError),
    /// Admission rejected because the request queue is full.
    #[error("request queue size exceeded: {limit}")]
    QueueOverflow { limit: usize },
    /// The connection cannot accept the operation in its current state.
    #[error(transparent)]
    State(#[from] StateError),
    /// The command was discarded by a reset, close or reconnect policy.
    #[error("command cancelled")]
    Cancelled,
    /// The caller stopped waiting; the command itself may still complete.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),
    /// The reply shape did not match what the decoder expected.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    /// The endpoint descriptor is missing or unusable.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// IO failure outside of connection establishment.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Returns true for errors caused by the peer violating the protocol.
    pub fn is_protocol(&self) -> bool {
        matches!(self, ClientError::Protocol(_))
    }

    /// Returns true when the command was cancelled rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }
}

/// Reasons a connection refuses new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("connection is closed")]
    Closed,
    #[error("connection is in a disconnected state and reconnect is disabled")]
    DisconnectedReconnectDisabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_keep_codec_message() {
        let err = ClientError::from(RespError::InvalidFirstByte(b'?'));
        assert!(err.is_protocol());
        assert!(err.to_string().starts_with("invalid first byte"));
    }

    #[test]
    fn state_messages_are_stable() {
        let err = ClientError::from(StateError::DisconnectedReconnectDisabled);
        assert!(err
            .to_string()
            .contains("disconnected state and reconnect is disabled"));
        assert_eq!(ClientError::QueueOverflow { limit: 3 }.to_string(), "request queue size exceeded: 3");
    }

    #[test]
    fn cancellation_has_no_source() {
        use std::error::Error;
        assert!(ClientError::Cancelled.source().is_none());
        assert!(ClientError::Cancelled.is_cancelled());
    }
}
