//! RESP wire codec
//!
//! Pure encoding and decoding: no I/O and no shared state. The connection
//! layer owns one [`RespDecoder`] per socket and drives it from its read loop.

pub mod decoder;
pub mod encoder;

pub use decoder::{RespDecoder, MAX_BULK_LEN, MAX_LINE_LEN};
pub use encoder::{RespEncoder, ZERO_COPY_THRESHOLD};
