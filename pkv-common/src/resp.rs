//! # RESP2 Values and Request Encoding
//!
//! Purpose: Model reply frames and encode client requests as arrays of bulk
//! strings, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **Binary-Safe**: Arguments and bulk payloads are raw bytes (`Bytes`).
//! 2. **Buffer Reuse**: Encoding appends into a caller-provided `BytesMut`.
//! 3. **No Correlation Ids**: Requests carry nothing but their arguments; the
//!    pipeline relies on wire order to match replies.

use bytes::{BufMut, Bytes, BytesMut};

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Bytes),
    /// -ERR ... responses.
    Error(Bytes),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for `$-1`.
    Bulk(Option<Bytes>),
    /// *... arrays, with None for `*-1`. Elements may nest.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Returns true for `-ERR` style replies.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Short name of the frame kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            RespValue::Simple(_) => "status",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::Bulk(Some(_)) => "bulk",
            RespValue::Bulk(None) => "null bulk",
            RespValue::Array(Some(_)) => "array",
            RespValue::Array(None) => "null array",
        }
    }
}

/// A request as sent on the wire: the command name followed by arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    args: Vec<Bytes>,
}

impl Request {
    /// Starts a request for the given command name.
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Request {
            args: vec![Bytes::copy_from_slice(name.as_ref())],
        }
    }

    /// Appends a binary-safe argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.push_arg(arg);
        self
    }

    /// Appends an integer argument in decimal form.
    pub fn arg_int(mut self, value: i64) -> Self {
        let mut buf = BytesMut::with_capacity(20);
        push_i64(&mut buf, value);
        self.args.push(buf.freeze());
        self
    }

    /// Appends a binary-safe argument in place.
    pub fn push_arg(&mut self, arg: impl AsRef<[u8]>) {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
    }

    /// Command name (first argument).
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    /// Returns true when the command name matches, ignoring ASCII case.
    pub fn is(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name.as_bytes())
    }

    /// All arguments including the command name.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Encodes the request into `out` as a RESP2 array of bulk strings.
    pub fn encode(&self, out: &mut BytesMut) {
        encode_command(&self.args, out);
    }
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], out: &mut BytesMut) {
    out.put_u8(b'*');
    push_usize(out, args.len());
    out.put_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        out.reserve(arg.len() + 16);
        out.put_u8(b'$');
        push_usize(out, arg.len());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
}

fn push_i64(out: &mut BytesMut, value: i64) {
    if value < 0 {
        out.put_u8(b'-');
    }
    push_u64(out, value.unsigned_abs());
}

fn push_usize(out: &mut BytesMut, value: usize) {
    push_u64(out, value as u64);
}

fn push_u64(out: &mut BytesMut, mut value: u64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    buf[..len].reverse();
    out.put_slice(&buf[..len]);
}
