//! # Resumable RESP2 Decoder
//!
//! Purpose: Turn an unframed byte stream into complete reply values, no matter
//! how the network slices it.
//!
//! ## Design Principles
//! 1. **Explicit State**: Partially received arrays live on a stack owned by
//!    the decoder, so decoding resumes where it stopped instead of rescanning.
//! 2. **Consume Whole Elements**: Bytes leave the buffer only once a complete
//!    scalar (or array header) is available.
//! 3. **Fail Fast**: An unknown type marker is rejected as soon as its byte
//!    arrives, without waiting for a line terminator or a timeout.
//! 4. **One Reply at a Time**: A second reply is never started until the
//!    current one (including all nested elements) is finished.
//!
//! ## State Overview
//!
//! ```text
//! RespDecoder
//!   └── stack: Vec<PartialArray>      (outermost first)
//!         └── PartialArray { len, items }
//!
//! *2\r\n  *1\r\n  :1\r\n  $3\r\nabc\r\n
//!  push    push    attach  attach
//!  [2]     [2,1]   [2]     []  -> Array([Array([1]), "abc"])
//! ```

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{RespError, RespResult};
use crate::resp::{Request, RespValue};

/// Maximum header line length before the stream is considered garbage.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Maximum bulk payload accepted from the peer (512 MiB).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

// Upper bound for pre-allocating array storage from an untrusted header.
const MAX_ARRAY_PREALLOC: usize = 1024;

#[derive(Debug)]
struct PartialArray {
    len: usize,
    items: Vec<RespValue>,
}

enum Element {
    Value(RespValue),
    ArrayHeader(usize),
}

/// Incremental reply decoder.
///
/// Feed it the read buffer after every read; it returns `Ok(None)` until a
/// full reply is buffered and leaves any trailing bytes for the next call.
#[derive(Debug, Default)]
pub struct RespDecoder {
    stack: Vec<PartialArray>,
}

impl RespDecoder {
    /// Creates a decoder with no partial state.
    pub fn new() -> Self {
        RespDecoder::default()
    }

    /// Returns true while an array reply is only partially decoded.
    pub fn is_mid_frame(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Drops any partially decoded reply.
    pub fn reset(&mut self) {
        self.stack.clear();
    }

    /// Decodes at most one complete reply from `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> RespResult<Option<RespValue>> {
        loop {
            let value = match next_element(buf)? {
                None => return Ok(None),
                Some(Element::Value(value)) => value,
                Some(Element::ArrayHeader(0)) => RespValue::Array(Some(Vec::new())),
                Some(Element::ArrayHeader(len)) => {
                    self.stack.push(PartialArray {
                        len,
                        items: Vec::with_capacity(len.min(MAX_ARRAY_PREALLOC)),
                    });
                    continue;
                }
            };

            if let Some(reply) = self.attach(value) {
                return Ok(Some(reply));
            }
        }
    }

    /// Adds a finished element to the innermost open array, closing arrays
    /// that become full. Returns the top-level reply once it is complete.
    fn attach(&mut self, mut value: RespValue) -> Option<RespValue> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Some(value);
            };
            top.items.push(value);
            if top.items.len() < top.len {
                return None;
            }
            let items = std::mem::take(&mut top.items);
            self.stack.pop();
            value = RespValue::Array(Some(items));
        }
    }
}

fn next_element(buf: &mut BytesMut) -> RespResult<Option<Element>> {
    let Some(&marker) = buf.first() else {
        return Ok(None);
    };
    if !matches!(marker, b'+' | b'-' | b':' | b'$' | b'*') {
        return Err(RespError::InvalidFirstByte(marker));
    }

    let Some(line_end) = find_crlf(buf)? else {
        return Ok(None);
    };
    let header_len = line_end + 2;

    match marker {
        b'+' => Ok(Some(Element::Value(RespValue::Simple(take_line(buf, line_end))))),
        b'-' => Ok(Some(Element::Value(RespValue::Error(take_line(buf, line_end))))),
        b':' => {
            let value = parse_i64(&buf[1..line_end]).ok_or(RespError::InvalidInteger)?;
            buf.advance(header_len);
            Ok(Some(Element::Value(RespValue::Integer(value))))
        }
        b'$' => {
            let len = parse_i64(&buf[1..line_end]).ok_or(RespError::InvalidLength)?;
            if len == -1 {
                buf.advance(header_len);
                return Ok(Some(Element::Value(RespValue::Bulk(None))));
            }
            if !(0..=MAX_BULK_LEN).contains(&len) {
                return Err(RespError::InvalidLength);
            }

            let len = len as usize;
            let total = header_len + len + 2;
            if buf.len() < total {
                buf.reserve(total - buf.len());
                return Ok(None);
            }
            if &buf[header_len + len..total] != b"\r\n" {
                return Err(RespError::MissingCrlf);
            }

            buf.advance(header_len);
            let data = buf.split_to(len).freeze();
            buf.advance(2);
            Ok(Some(Element::Value(RespValue::Bulk(Some(data)))))
        }
        _ => {
            let len = parse_i64(&buf[1..line_end]).ok_or(RespError::InvalidLength)?;
            buf.advance(header_len);
            match len {
                -1 => Ok(Some(Element::Value(RespValue::Array(None)))),
                len if len < 0 => Err(RespError::InvalidLength),
                len => Ok(Some(Element::ArrayHeader(len as usize))),
            }
        }
    }
}

/// Finds the index of `\r` in the first `\r\n` of the buffer.
fn find_crlf(buf: &[u8]) -> RespResult<Option<usize>> {
    match buf.windows(2).position(|pair| pair == b"\r\n") {
        Some(idx) => Ok(Some(idx)),
        None if buf.len() > MAX_LINE_LEN => Err(RespError::LineTooLong(MAX_LINE_LEN)),
        None => Ok(None),
    }
}

fn take_line(buf: &mut BytesMut, line_end: usize) -> bytes::Bytes {
    let mut line = buf.split_to(line_end + 2);
    line.truncate(line_end);
    line.advance(1);
    line.freeze()
}

fn parse_i64(data: &[u8]) -> Option<i64> {
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, data),
    };
    if digits.is_empty() {
        return None;
    }

    // Accumulate towards the sign so `i64::MIN` fits.
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        let digit = (b - b'0') as i64;
        value = value.checked_mul(10)?;
        value = if negative {
            value.checked_sub(digit)?
        } else {
            value.checked_add(digit)?
        };
    }

    Some(value)
}

/// `tokio-util` codec pairing the request encoder with the reply decoder.
#[derive(Debug, Default)]
pub struct RespCodec {
    decoder: RespDecoder,
}

impl RespCodec {
    /// Creates a codec with a fresh decoder.
    pub fn new() -> Self {
        RespCodec::default()
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> RespResult<Option<RespValue>> {
        self.decoder.decode(src)
    }
}

impl<'a> Encoder<&'a Request> for RespCodec {
    type Error = RespError;

    fn encode(&mut self, item: &'a Request, dst: &mut BytesMut) -> RespResult<()> {
        item.encode(dst);
        Ok(())
    }
}
