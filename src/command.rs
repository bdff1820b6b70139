//! Commands as ordered lists of binary-safe arguments

use crate::core::error::{RedisError, RedisResult};
use bytes::Bytes;
use std::fmt;

/// Anything that can be written as a single bulk-string argument
pub trait ToArg {
    /// Produce the raw argument bytes
    fn to_arg(&self) -> Bytes;
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

impl ToArg for str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl<const N: usize> ToArg for [u8; N] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Bytes {
        (**self).to_arg()
    }
}

macro_rules! numeric_arg {
    ($($t:ty),*) => {
        $(
            impl ToArg for $t {
                fn to_arg(&self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

numeric_arg!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

/// A Redis command: a non-empty, immutable list of arguments
///
/// The first argument is the command name.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Start a command with the given name
    pub fn new(name: impl ToArg) -> Self {
        Self {
            args: vec![name.to_arg()],
        }
    }

    /// Build a command from a complete argument list
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Config`] if `args` is empty.
    pub fn from_args<I, A>(args: I) -> RedisResult<Self>
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        let args: Vec<Bytes> = args.into_iter().map(|a| a.to_arg()).collect();
        if args.is_empty() {
            return Err(RedisError::Config("Command has no arguments".to_string()));
        }
        Ok(Self { args })
    }

    /// Append an argument
    #[must_use]
    pub fn arg(mut self, arg: impl ToArg) -> Self {
        self.args.push(arg.to_arg());
        self
    }

    /// Append several arguments
    #[must_use]
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.args.extend(args.into_iter().map(|a| a.to_arg()));
        self
    }

    /// The command name (first argument), lossily decoded for diagnostics
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_uppercase()
    }

    /// All arguments including the name
    pub fn as_args(&self) -> &[Bytes] {
        &self.args
    }

    /// Number of arguments including the name
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.args.len()
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // arguments may carry credentials; only the name is printed
        f.debug_struct("Command")
            .field("name", &self.name())
            .field("argc", &self.args.len())
            .finish()
    }
}

/// Build a [`Command`] from a name and arguments
///
/// ```
/// use redis_relay::cmd;
/// let set = cmd!("SET", "key", "value");
/// assert_eq!(set.len(), 3);
/// ```
#[macro_export]
macro_rules! cmd {
    ($name:expr $(, $arg:expr)* $(,)?) => {
        $crate::Command::new($name)$(.arg($arg))*
    };
}
