//! # Protocol Errors
//!
//! Purpose: Describe every way a byte stream can fail to be valid RESP2.
//!
//! The protocol has no resynchronization point, so any of these errors makes
//! the remainder of the stream unreliable. Callers are expected to drop the
//! transport once one is returned.

use std::io;

use thiserror::Error;

/// Result type for codec operations.
pub type RespResult<T> = Result<T, RespError>;

/// Framing or parse failure while decoding replies.
#[derive(Debug, Error)]
pub enum RespError {
    /// The leading type marker is not one of `+ - : $ *`.
    ///
    /// Usually means the peer is not speaking RESP at all.
    #[error("invalid first byte: {}", describe_byte(.0))]
    InvalidFirstByte(u8),
    /// A bulk or array header carried a malformed or out-of-range length.
    #[error("invalid length in frame header")]
    InvalidLength,
    /// An integer reply did not contain a valid signed 64-bit number.
    #[error("invalid integer reply")]
    InvalidInteger,
    /// A bulk payload was not followed by `\r\n`.
    #[error("missing CRLF after bulk payload")]
    MissingCrlf,
    /// A header line grew past the limit without a terminator.
    #[error("header line exceeds {0} bytes")]
    LineTooLong(usize),
    /// A well-formed frame arrived where a different one was required.
    #[error("unexpected reply: {0}")]
    Unexpected(String),
    /// Underlying stream failure surfaced through the codec.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Clone for RespError {
    fn clone(&self) -> Self {
        match self {
            RespError::InvalidFirstByte(byte) => RespError::InvalidFirstByte(*byte),
            RespError::InvalidLength => RespError::InvalidLength,
            RespError::InvalidInteger => RespError::InvalidInteger,
            RespError::MissingCrlf => RespError::MissingCrlf,
            RespError::LineTooLong(limit) => RespError::LineTooLong(*limit),
            RespError::Unexpected(message) => RespError::Unexpected(message.clone()),
            // `io::Error` is not `Clone`; keep its kind and message.
            RespError::Io(err) => RespError::Io(io::Error::new(err.kind(), err.to_string())),
        }
    }
}

fn describe_byte(byte: &u8) -> String {
    format!("{byte:#04x} ('{}')", std::ascii::escape_default(*byte))
}
