//! Unified error taxonomy shared by every async operation (spec §7).
//!
//! All async operations report through this type rather than a bare
//! `std::io::Error` so that cancellation and EOF have first-class,
//! platform-independent representations instead of being squeezed into
//! `io::ErrorKind`.

use std::fmt;
use std::io;

/// The kind of failure (or success sentinel) an operation completed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Success sentinel. `Error::is_success` is true only for this kind.
    None,
    /// The operation was aborted via cancel, a stop-token firing, or the
    /// owning object being closed.
    Cancelled,
    /// The peer closed the stream cleanly (a zero-length read where the
    /// caller's buffer was not itself empty).
    Eof,
    /// The underlying stream ended mid-TLS-record without a close_notify.
    StreamTruncated,
    /// The requested flag or option is not available on this platform.
    NotSupported,
    /// Bad argument: invalid fd/handle, malformed endpoint, incompatible
    /// flag combination.
    InvalidArgument,
    /// Any other OS error, carrying the platform error code.
    System,
    /// Reserved for test mock streams (spec §7); never produced by this
    /// crate's own code.
    TestFailure,
}

/// A unified error value carrying an [`ErrorKind`] plus, for [`ErrorKind::System`],
/// the originating [`std::io::Error`].
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    // Only ever `Some` for `ErrorKind::System`; kept as an `io::ErrorKind`
    // rather than the full `io::Error` so `Error` stays `Clone`.
    source: Option<io::ErrorKind>,
    raw_os_error: Option<i32>,
    message: Option<&'static str>,
}

impl Error {
    fn new(kind: ErrorKind) -> Error {
        Error {
            kind,
            source: None,
            raw_os_error: None,
            message: None,
        }
    }

    /// Success sentinel (spec §7, `none`).
    pub const fn none() -> Error {
        Error {
            kind: ErrorKind::None,
            source: None,
            raw_os_error: None,
            message: None,
        }
    }

    pub fn cancelled() -> Error {
        Error::new(ErrorKind::Cancelled)
    }

    pub fn eof() -> Error {
        Error::new(ErrorKind::Eof)
    }

    pub fn stream_truncated() -> Error {
        Error::new(ErrorKind::StreamTruncated)
    }

    pub fn not_supported(message: &'static str) -> Error {
        let mut e = Error::new(ErrorKind::NotSupported);
        e.message = Some(message);
        e
    }

    pub fn invalid_argument(message: &'static str) -> Error {
        let mut e = Error::new(ErrorKind::InvalidArgument);
        e.message = Some(message);
        e
    }

    pub fn system(err: io::Error) -> Error {
        Error {
            kind: ErrorKind::System,
            raw_os_error: err.raw_os_error(),
            source: Some(err.kind()),
            message: None,
        }
    }

    /// Reserved for the mock stream test collaborator (spec §6/§7); never
    /// produced by this crate's own sockets/timers/resolver/signals. Not
    /// `#[cfg(test)]`-gated because `tests/support`'s mock stream is an
    /// external crate from this library's point of view and needs to
    /// construct it too.
    pub fn test_failure(message: &'static str) -> Error {
        let mut e = Error::new(ErrorKind::TestFailure);
        e.message = Some(message);
        e
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_success(&self) -> bool {
        self.kind == ErrorKind::None
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        self.raw_os_error
    }

    /// Maps this error back onto a plain `io::Error` for interop with code
    /// that only understands the standard library's error model (e.g.
    /// `std::io::Read`/`Write` impls elsewhere in the crate).
    pub fn into_io_error(self) -> io::Error {
        match self.kind {
            ErrorKind::None => io::Error::new(io::ErrorKind::Other, "no error"),
            ErrorKind::Cancelled => io::Error::new(io::ErrorKind::Interrupted, "cancelled"),
            ErrorKind::Eof => io::Error::new(io::ErrorKind::UnexpectedEof, "eof"),
            ErrorKind::StreamTruncated => {
                io::Error::new(io::ErrorKind::UnexpectedEof, "stream truncated")
            }
            ErrorKind::NotSupported => io::Error::new(
                io::ErrorKind::Unsupported,
                self.message.unwrap_or("not supported"),
            ),
            ErrorKind::InvalidArgument => io::Error::new(
                io::ErrorKind::InvalidInput,
                self.message.unwrap_or("invalid argument"),
            ),
            ErrorKind::System => match self.source {
                Some(kind) => io::Error::new(kind, "system error"),
                None => io::Error::new(io::ErrorKind::Other, "system error"),
            },
            ErrorKind::TestFailure => {
                io::Error::new(io::ErrorKind::Other, self.message.unwrap_or("test failure"))
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::None => write!(f, "success"),
            ErrorKind::Cancelled => write!(f, "operation cancelled"),
            ErrorKind::Eof => write!(f, "end of file"),
            ErrorKind::StreamTruncated => write!(f, "stream truncated (no close_notify)"),
            ErrorKind::NotSupported => {
                write!(f, "not supported: {}", self.message.unwrap_or(""))
            }
            ErrorKind::InvalidArgument => {
                write!(f, "invalid argument: {}", self.message.unwrap_or(""))
            }
            ErrorKind::System => match (self.raw_os_error, self.source) {
                (Some(code), _) => write!(f, "system error (os error {code})"),
                (None, Some(kind)) => write!(f, "system error ({kind})"),
                (None, None) => write!(f, "system error"),
            },
            ErrorKind::TestFailure => write!(f, "test failure: {}", self.message.unwrap_or("")),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    /// EAGAIN/EWOULDBLOCK never reach here: call sites that might see them
    /// must branch before converting, since a would-block is not a
    /// completion (it signals "register with the reactor"), per spec §4.2.
    fn from(err: io::Error) -> Error {
        Error::system(err)
    }
}

/// Convenience alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, Error>;
