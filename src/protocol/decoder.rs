//! Incremental RESP reply decoder
//!
//! Bytes are fed in arbitrary chunks; values come out once complete. Nested
//! arrays are tracked on an explicit stack rather than by recursion, so the
//! nesting depth of a reply is bounded only by memory and a chunk boundary
//! may fall on any byte.

use crate::core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use bytes::{Buf, Bytes, BytesMut};

/// Largest bulk string accepted, matching the server's default `proto-max-bulk-len`
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Longest header or status line accepted before its CRLF
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// An array whose elements are still arriving
#[derive(Debug)]
struct Frame {
    remaining: usize,
    items: Vec<RespValue>,
}

/// Streaming RESP decoder
///
/// Keeps partially received data between calls; nothing already consumed
/// is parsed twice.
#[derive(Debug, Default)]
pub struct RespDecoder {
    buf: BytesMut,
    /// offset in `buf` where the CRLF search resumes
    scan: usize,
    /// payload length of a bulk string whose header was consumed
    bulk: Option<usize>,
    stack: Vec<Frame>,
    poisoned: Option<String>,
}

impl RespDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder with a pre-sized receive buffer
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Append received bytes
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Buffer the read loop reads into directly; only appending is allowed
    pub(crate) fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Feed a chunk and drain every value it completes
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the stream is malformed.
    pub fn decode_all(&mut self, chunk: &[u8]) -> RedisResult<Vec<RespValue>> {
        self.feed(chunk);
        let mut values = Vec::new();
        while let Some(value) = self.decode()? {
            values.push(value);
        }
        Ok(values)
    }

    /// True when no reply is partially decoded
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty() && self.bulk.is_none() && self.buf.is_empty()
    }

    /// Number of arrays currently open
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Try to decode the next complete top-level value
    ///
    /// Returns `Ok(None)` when more input is needed; state is kept for the
    /// next call.
    ///
    /// # Errors
    ///
    /// A malformed stream is a fatal protocol error. Once one is reported
    /// the decoder keeps returning it.
    pub fn decode(&mut self) -> RedisResult<Option<RespValue>> {
        if let Some(reason) = &self.poisoned {
            return Err(RedisError::Protocol(reason.clone()));
        }

        loop {
            let value = if let Some(len) = self.bulk {
                if self.buf.len() < len + 2 {
                    return Ok(None);
                }
                if &self.buf[len..len + 2] != b"\r\n" {
                    return Err(self.poison("Bulk string not terminated by CRLF".to_string()));
                }
                let data = self.buf.split_to(len).freeze();
                self.buf.advance(2);
                self.bulk = None;
                RespValue::BulkString(data)
            } else {
                let Some(&prefix) = self.buf.first() else {
                    return Ok(None);
                };
                if !matches!(prefix, b'+' | b'-' | b':' | b'$' | b'*') {
                    return Err(self.poison(format!(
                        "Invalid RESP type byte: {:?}",
                        prefix as char
                    )));
                }
                let Some(end) = self.find_crlf() else {
                    if self.buf.len() > MAX_LINE_LEN {
                        return Err(self.poison(format!(
                            "Reply line exceeds {MAX_LINE_LEN} bytes without CRLF"
                        )));
                    }
                    return Ok(None);
                };
                if end > MAX_LINE_LEN {
                    return Err(self.poison(format!("Reply line exceeds {MAX_LINE_LEN} bytes")));
                }
                let line = self.buf.split_to(end + 2).freeze();
                self.scan = 0;

                match self.parse_line(prefix, line.slice(1..end))? {
                    Some(value) => value,
                    None => continue,
                }
            };

            if let Some(done) = self.complete(value) {
                return Ok(Some(done));
            }
        }
    }

    /// Interpret one header line. `None` means a frame was opened and more
    /// input belongs to it.
    fn parse_line(&mut self, prefix: u8, body: Bytes) -> RedisResult<Option<RespValue>> {
        match prefix {
            b'+' => Ok(Some(RespValue::BulkString(body))),
            b'-' => Ok(Some(RespValue::Error(
                String::from_utf8_lossy(&body).into_owned(),
            ))),
            b':' => Ok(Some(RespValue::Integer(self.parse_int(&body, "integer")?))),
            b'$' => match self.parse_int(&body, "bulk string length")? {
                -1 => Ok(Some(RespValue::Null)),
                len if len < 0 || len as usize > MAX_BULK_LEN => Err(self.poison(format!(
                    "Invalid bulk string length: {len}"
                ))),
                len => {
                    self.bulk = Some(len as usize);
                    Ok(None)
                }
            },
            _ => match self.parse_int(&body, "array length")? {
                -1 => Ok(Some(RespValue::Null)),
                0 => Ok(Some(RespValue::Array(Vec::new()))),
                len if len < 0 => Err(self.poison(format!("Invalid array length: {len}"))),
                len => {
                    let len = len as usize;
                    self.stack.push(Frame {
                        remaining: len,
                        items: Vec::with_capacity(len.min(1024)),
                    });
                    Ok(None)
                }
            },
        }
    }

    /// Attach a finished value to the innermost open array, closing every
    /// array it completes. Returns the value once it is top-level.
    fn complete(&mut self, mut value: RespValue) -> Option<RespValue> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Some(value);
            };
            frame.items.push(value);
            frame.remaining -= 1;
            if frame.remaining > 0 {
                return None;
            }
            let items = std::mem::take(&mut frame.items);
            self.stack.pop();
            value = RespValue::Array(items);
        }
    }

    fn find_crlf(&mut self) -> Option<usize> {
        let start = self.scan;
        match self.buf[start..].windows(2).position(|w| w == b"\r\n") {
            Some(pos) => Some(start + pos),
            None => {
                // a trailing '\r' may pair with the next chunk's '\n'
                self.scan = self.buf.len().saturating_sub(1).max(start);
                None
            }
        }
    }

    fn parse_int(&mut self, body: &[u8], what: &str) -> RedisResult<i64> {
        std::str::from_utf8(body)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                self.poison(format!(
                    "Invalid {what}: {:?}",
                    String::from_utf8_lossy(body)
                ))
            })
    }

    fn poison(&mut self, reason: String) -> RedisError {
        self.poisoned = Some(reason.clone());
        RedisError::Protocol(reason)
    }
}
