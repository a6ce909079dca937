use std::io;

use thiserror::Error;

/// Errors surfaced by netloop operations.
///
/// Every failure of an awaited operation resolves to one of these kinds.
/// Platform-specific error codes are normalised (`EPIPE`, `ECONNRESET` and
/// friends all become [`Error::Disconnected`]) while the underlying OS code
/// is retained for diagnostics via [`Error::os_error`].
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed IP literal passed to [`parse_addr`](crate::parse_addr).
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    /// The peer refused the connection (RST during connect or early I/O).
    #[error("connection refused")]
    ConnectionRefused,
    /// The peer went away mid-stream (broken pipe, reset, abrupt close).
    #[error("peer disconnected")]
    Disconnected {
        /// Raw OS error code, when one was reported.
        code: Option<i32>,
    },
    /// A deadline elapsed before the operation completed.
    #[error("operation timed out")]
    TimedOut,
    /// EOF arrived before an exact-length read was satisfied.
    #[error("short read: got {got} of {expected} bytes")]
    ShortRead {
        /// Bytes requested.
        expected: usize,
        /// Bytes actually read before EOF.
        got: usize,
    },
    /// A bounded buffer (line splitter) would exceed its capacity.
    #[error("buffer capacity exceeded")]
    Overflow,
    /// NXDOMAIN, or every configured nameserver was exhausted.
    #[error("name resolution failed: {0}")]
    ResolveFailed(String),
    /// The awaited task was cancelled before completion.
    #[error("task cancelled")]
    Cancelled,
    /// Uncategorised OS or backend error.
    #[error("I/O error: {0}")]
    Backend(#[from] io::Error),
}

impl Error {
    /// Classify an OS error into the closed taxonomy, keeping the raw code.
    pub(crate) fn from_io(e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Error::Disconnected {
                code: e.raw_os_error(),
            },
            io::ErrorKind::TimedOut => Error::TimedOut,
            _ => Error::Backend(e),
        }
    }

    /// The underlying OS error code, if this error carries one.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::Disconnected { code } => *code,
            Error::Backend(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_refused() {
        let e = Error::from_io(io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert!(matches!(e, Error::ConnectionRefused));
    }

    #[test]
    fn classifies_broken_pipe_with_code() {
        let e = Error::from_io(io::Error::from_raw_os_error(libc::EPIPE));
        match e {
            Error::Disconnected { code } => assert_eq!(code, Some(libc::EPIPE)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classifies_reset_with_code() {
        let e = Error::from_io(io::Error::from_raw_os_error(libc::ECONNRESET));
        match e {
            Error::Disconnected { code } => assert_eq!(code, Some(libc::ECONNRESET)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn uncategorised_keeps_os_code() {
        let e = Error::from_io(io::Error::from_raw_os_error(libc::ENOMEM));
        assert_eq!(e.os_error(), Some(libc::ENOMEM));
    }
}
