
//! Error type definitions.

use std::borrow::Cow;
use std::convert::TryFrom;
use std::io::ErrorKind;

/// A result that, if ok, contains a value, and otherwise contains an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A result that, if ok, contains nothing, and otherwise contains an [`Error`].
pub type UnitResult = Result<()>;

/// An error from the standard input/output machinery.
pub use std::io::Error as IoError;

/// A result from the standard input/output machinery.
pub use std::io::Result as IoResult;

/// All errors the codec can surface at a dispatch boundary
/// (`init`, `push_packet`, `decode`, `packetize`).
/// Compute passes themselves never fail.
///
/// Recoverable wire events (a stale sequence, a duplicated block) are not
/// errors: they are logged and silently skipped.
#[derive(Debug)]
pub enum Error {

    /// The device does not offer a capability the codec requires,
    /// for example a subgroup feature or half-float storage.
    Unsupported(Cow<'static, str>),

    /// The session was configured with invalid parameters,
    /// for example a frame smaller than the minimum image size.
    Configuration(Cow<'static, str>),

    /// A wire packet is structurally inconsistent and was rejected
    /// without modifying any decoder state.
    Malformed(Cow<'static, str>),

    /// The underlying byte stream could not be read or written.
    Io(IoError),
}

impl Error {

    /// Create an error declaring invalid session parameters.
    pub(crate) fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Error::Configuration(message.into())
    }

    /// Create an error declaring a structurally broken packet or stream.
    pub(crate) fn malformed(message: impl Into<Cow<'static, str>>) -> Self {
        Error::Malformed(message.into())
    }

    /// Create an error declaring a missing device capability.
    pub(crate) fn unsupported(message: impl Into<Cow<'static, str>>) -> Self {
        Error::Unsupported(message.into())
    }
}

/// Enable using the `?` operator on `io::Result`.
impl From<IoError> for Error {
    fn from(error: IoError) -> Self {
        if error.kind() == ErrorKind::UnexpectedEof {
            Error::malformed("unexpected end of stream")
        }
        else {
            Error::Io(error)
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Unsupported(message) => write!(formatter, "unsupported device: {}", message),
            Error::Configuration(message) => write!(formatter, "invalid configuration: {}", message),
            Error::Malformed(message) => write!(formatter, "malformed bitstream: {}", message),
            Error::Io(error) => write!(formatter, "io error: {}", error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(error) => Some(error),
            _ => None,
        }
    }
}

/// Convert a `usize` into a `u32`, returning a malformed-stream error on overflow.
#[inline]
pub(crate) fn usize_to_u32(value: usize, context: &'static str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::malformed(context))
}
