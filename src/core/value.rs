//! RESP (`REdis` Serialization Protocol) value types

use crate::core::error::{RedisError, RedisResult};
use bytes::Bytes;

/// A decoded RESP reply
///
/// Simple strings (`+OK\r\n`) are surfaced as [`RespValue::BulkString`] so
/// callers only ever see four data shapes plus the reply-error variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Null bulk string or null array: `$-1\r\n`, `*-1\r\n`
    Null,
    /// Integer: `:1000\r\n`
    Integer(i64),
    /// Bulk or simple string: `$6\r\nfoobar\r\n`, `+OK\r\n`
    BulkString(Bytes),
    /// Array: `*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n`
    Array(Vec<RespValue>),
    /// Error reply: `-ERR message\r\n`
    Error(String),
}

impl RespValue {
    /// Convert to a string if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a UTF-8 bulk string.
    pub fn as_string(&self) -> RedisResult<String> {
        match self {
            Self::BulkString(b) => String::from_utf8(b.to_vec())
                .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {e}"))),
            Self::Integer(i) => Ok(i.to_string()),
            Self::Null => Err(RedisError::Type("Value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to string"
            ))),
        }
    }

    /// Convert to an integer if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an integer.
    pub fn as_int(&self) -> RedisResult<i64> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::BulkString(b) => {
                let s = std::str::from_utf8(b)
                    .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {e}")))?;
                s.parse::<i64>()
                    .map_err(|e| RedisError::Type(format!("Cannot parse integer: {e}")))
            }
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to integer"
            ))),
        }
    }

    /// Convert to bytes if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a bulk string.
    pub fn as_bytes(&self) -> RedisResult<Bytes> {
        match self {
            Self::BulkString(b) => Ok(b.clone()),
            Self::Null => Err(RedisError::Type("Value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to bytes"
            ))),
        }
    }

    /// Convert to an array if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an array.
    pub fn as_array(&self) -> RedisResult<&[Self]> {
        match self {
            Self::Array(arr) => Ok(arr),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to array"
            ))),
        }
    }

    /// Check if this is a null value
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check for the `OK` status reply
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::BulkString(b) if b.as_ref() == b"OK")
    }

    /// Turn an error reply into `Err`, pass every other value through
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Server`] carrying the reply text for error replies.
    pub fn into_result(self) -> RedisResult<Self> {
        match self {
            Self::Error(msg) => Err(RedisError::Server(msg)),
            other => Ok(other),
        }
    }
}

impl From<String> for RespValue {
    fn from(s: String) -> Self {
        Self::BulkString(Bytes::from(s.into_bytes()))
    }
}
impl From<&str> for RespValue {
    fn from(s: &str) -> Self {
        Self::BulkString(Bytes::copy_from_slice(s.as_bytes()))
    }
}
impl From<i64> for RespValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}
impl From<Vec<u8>> for RespValue {
    fn from(b: Vec<u8>) -> Self {
        Self::BulkString(Bytes::from(b))
    }
}
impl From<Bytes> for RespValue {
    fn from(b: Bytes) -> Self {
        Self::BulkString(b)
    }
}
impl From<Vec<Self>> for RespValue {
    fn from(items: Vec<Self>) -> Self {
        Self::Array(items)
    }
}

/// Decoding hook for the command-builder layer
///
/// The connection core hands back raw [`RespValue`]s; this trait is how
/// callers turn them into domain types.
pub trait FromResp: Sized {
    /// Convert a reply into `Self`
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Type`] when the reply has the wrong shape.
    fn from_resp(value: RespValue) -> RedisResult<Self>;
}

impl FromResp for RespValue {
    fn from_resp(value: RespValue) -> RedisResult<Self> {
        Ok(value)
    }
}

impl FromResp for String {
    fn from_resp(value: RespValue) -> RedisResult<Self> {
        value.as_string()
    }
}

impl FromResp for i64 {
    fn from_resp(value: RespValue) -> RedisResult<Self> {
        value.as_int()
    }
}

impl FromResp for bool {
    fn from_resp(value: RespValue) -> RedisResult<Self> {
        match value {
            RespValue::Integer(1) => Ok(true),
            RespValue::Integer(0) | RespValue::Null => Ok(false),
            ref v if v.is_ok() => Ok(true),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {:?} to bool",
                value
            ))),
        }
    }
}

impl FromResp for Bytes {
    fn from_resp(value: RespValue) -> RedisResult<Self> {
        value.as_bytes()
    }
}

impl FromResp for Vec<u8> {
    fn from_resp(value: RespValue) -> RedisResult<Self> {
        value.as_bytes().map(|b| b.to_vec())
    }
}

impl FromResp for () {
    fn from_resp(_value: RespValue) -> RedisResult<Self> {
        Ok(())
    }
}

impl<T: FromResp> FromResp for Option<T> {
    fn from_resp(value: RespValue) -> RedisResult<Self> {
        match value {
            RespValue::Null => Ok(None),
            other => T::from_resp(other).map(Some),
        }
    }
}

impl<T: FromResp> FromResp for Vec<T> {
    fn from_resp(value: RespValue) -> RedisResult<Self> {
        match value {
            RespValue::Array(items) => items.into_iter().map(T::from_resp).collect(),
            RespValue::Null => Ok(Vec::new()),
            other => Err(RedisError::Type(format!(
                "Cannot convert {other:?} to array"
            ))),
        }
    }
}

impl TryFrom<RespValue> for String {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_string()
    }
}

impl TryFrom<RespValue> for i64 {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_int()
    }
}

impl TryFrom<RespValue> for bool {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        Self::from_resp(value)
    }
}
