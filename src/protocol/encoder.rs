//! RESP request encoding

use crate::command::Command;
use bytes::{BufMut, Bytes, BytesMut};

const CRLF: &[u8] = b"\r\n";

/// Arguments at least this long are referenced, not copied, by
/// [`RespEncoder::encode_chunks`].
pub const ZERO_COPY_THRESHOLD: usize = 1024;

/// Encodes commands into RESP request bytes
pub struct RespEncoder;

impl RespEncoder {
    /// Encode a command into a contiguous buffer
    ///
    /// Produces `*<argc>\r\n` followed by `$<len>\r\n<bytes>\r\n` per argument.
    pub fn encode_command(command: &Command, buf: &mut BytesMut) {
        buf.reserve(Self::encoded_len(command));
        Self::put_header(buf, b'*', command.len());
        for arg in command.as_args() {
            Self::put_header(buf, b'$', arg.len());
            buf.put_slice(arg);
            buf.put_slice(CRLF);
        }
    }

    /// Encode a command into a list of chunks for scatter writes
    ///
    /// Large arguments are shared with the command instead of being copied;
    /// the surrounding framing is batched into as few chunks as possible.
    pub fn encode_chunks(command: &Command) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        let mut head = BytesMut::with_capacity(64);
        Self::put_header(&mut head, b'*', command.len());

        for arg in command.as_args() {
            Self::put_header(&mut head, b'$', arg.len());
            if arg.len() >= ZERO_COPY_THRESHOLD {
                chunks.push(head.split().freeze());
                chunks.push(arg.clone());
            } else {
                head.put_slice(arg);
            }
            head.put_slice(CRLF);
        }

        if !head.is_empty() {
            chunks.push(head.freeze());
        }
        chunks
    }

    /// Exact number of bytes the encoded command occupies on the wire
    pub fn encoded_len(command: &Command) -> usize {
        let args = command.as_args();
        let mut len = 1 + digits(args.len()) + 2;
        for arg in args {
            len += 1 + digits(arg.len()) + 2 + arg.len() + 2;
        }
        len
    }

    fn put_header(buf: &mut BytesMut, prefix: u8, len: usize) {
        buf.put_u8(prefix);
        buf.put_slice(len.to_string().as_bytes());
        buf.put_slice(CRLF);
    }
}

fn digits(mut n: usize) -> usize {
    let mut count = 1;
    while n >= 10 {
        n /= 10;
        count += 1;
    }
    count
}
