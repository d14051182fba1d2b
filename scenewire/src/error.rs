//! Transport error codes.
//!
//! Every failure that crosses the transport boundary is a [`TransportError`]:
//! a typed [`ErrorCode`] plus the human-readable detail reported by the
//! underlying socket layer. Raw codes are non-zero; `0` is reserved for
//! success so codes can be handed across an FFI-style status boundary.

use std::fmt;
use std::io;

use thiserror::Error;

/// Typed transport error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// The operation was interrupted.
    Interrupted = 1,
    /// An argument was malformed (e.g. an invalid message).
    InvalidArgument = 3,
    /// The resource is busy.
    Busy = 4,
    /// The operation did not complete before its deadline.
    TimedOut = 5,
    /// The remote side refused the connection.
    ConnectionRefused = 6,
    /// The channel (or runtime) was closed.
    Closed = 7,
    /// The operation would block; retry later.
    TryAgain = 8,
    /// The operation is not supported by this protocol.
    NotSupported = 9,
    /// The local address is already bound.
    AddressInUse = 10,
    /// The protocol is in the wrong state for this operation.
    State = 11,
    /// The requested entry does not exist.
    NotFound = 12,
    /// The peer violated the wire protocol.
    Protocol = 13,
    /// The destination is unreachable.
    Unreachable = 14,
    /// The address could not be parsed or resolved.
    AddressInvalid = 15,
    /// Permission denied.
    PermissionDenied = 16,
    /// A message exceeded the configured size limit.
    MessageTooLarge = 17,
    /// The connection was aborted locally.
    ConnectionAborted = 18,
    /// The connection was reset by the peer.
    ConnectionReset = 19,
    /// The operation was deliberately cancelled.
    Canceled = 20,
    /// Any other operating system error.
    Io = 1000,
}

impl ErrorCode {
    const ALL: [Self; 20] = [
        Self::Interrupted,
        Self::InvalidArgument,
        Self::Busy,
        Self::TimedOut,
        Self::ConnectionRefused,
        Self::Closed,
        Self::TryAgain,
        Self::NotSupported,
        Self::AddressInUse,
        Self::State,
        Self::NotFound,
        Self::Protocol,
        Self::Unreachable,
        Self::AddressInvalid,
        Self::PermissionDenied,
        Self::MessageTooLarge,
        Self::ConnectionAborted,
        Self::ConnectionReset,
        Self::Canceled,
        Self::Io,
    ];

    /// Returns the raw, always non-zero code.
    #[must_use]
    pub const fn raw(self) -> i32 {
        self as i32
    }

    /// Maps a raw code back to its variant. `0` (success) and unknown codes yield `None`.
    #[must_use]
    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.raw() == raw)
    }

    /// Short description used when no transport detail is available.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Interrupted => "interrupted",
            Self::InvalidArgument => "invalid argument",
            Self::Busy => "resource busy",
            Self::TimedOut => "timed out",
            Self::ConnectionRefused => "connection refused",
            Self::Closed => "object closed",
            Self::TryAgain => "try again",
            Self::NotSupported => "not supported",
            Self::AddressInUse => "address in use",
            Self::State => "incorrect state",
            Self::NotFound => "entry not found",
            Self::Protocol => "protocol error",
            Self::Unreachable => "destination unreachable",
            Self::AddressInvalid => "address invalid",
            Self::PermissionDenied => "permission denied",
            Self::MessageTooLarge => "message too large",
            Self::ConnectionAborted => "connection aborted",
            Self::ConnectionReset => "connection reset",
            Self::Canceled => "operation canceled",
            Self::Io => "system error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A transport failure: typed code plus the underlying error string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", render(*.code, .detail))]
pub struct TransportError {
    code: ErrorCode,
    detail: String,
}

impl TransportError {
    /// Creates an error with an explicit detail string.
    #[must_use]
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    /// Creates an error whose detail is the code's own description.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.description())
    }

    /// Builds an error from a raw status code; `0` means success and yields `None`.
    #[must_use]
    pub fn from_raw(raw: i32) -> Option<Self> {
        if raw == 0 {
            return None;
        }
        Some(match ErrorCode::from_raw(raw) {
            Some(code) => Self::from_code(code),
            None => Self::new(ErrorCode::Io, format!("unknown error code {raw}")),
        })
    }

    pub(crate) fn canceled() -> Self {
        Self::from_code(ErrorCode::Canceled)
    }

    pub(crate) fn timed_out() -> Self {
        Self::from_code(ErrorCode::TimedOut)
    }

    pub(crate) fn closed() -> Self {
        Self::from_code(ErrorCode::Closed)
    }

    /// The typed error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// The raw, non-zero error code.
    #[must_use]
    pub const fn raw(&self) -> i32 {
        self.code.raw()
    }

    /// The underlying transport error string.
    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// `true` when the operation was deliberately cancelled rather than failed.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.code == ErrorCode::Canceled
    }

    /// `true` for cancellation or closure, i.e. teardown rather than a fault.
    #[must_use]
    pub fn is_teardown(&self) -> bool {
        matches!(self.code, ErrorCode::Canceled | ErrorCode::Closed)
    }
}

fn render(code: ErrorCode, detail: &str) -> String {
    if detail == code.description() {
        code.to_string()
    } else {
        format!("{code}: {detail}")
    }
}

impl From<ErrorCode> for TransportError {
    fn from(code: ErrorCode) -> Self {
        Self::from_code(code)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::NotFound => ErrorCode::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => ErrorCode::ConnectionReset,
            ErrorKind::ConnectionAborted => ErrorCode::ConnectionAborted,
            ErrorKind::TimedOut => ErrorCode::TimedOut,
            ErrorKind::WouldBlock => ErrorCode::TryAgain,
            ErrorKind::Interrupted => ErrorCode::Interrupted,
            ErrorKind::AddrInUse => ErrorCode::AddressInUse,
            ErrorKind::AddrNotAvailable => ErrorCode::AddressInvalid,
            ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            ErrorKind::InvalidInput => ErrorCode::InvalidArgument,
            ErrorKind::UnexpectedEof => ErrorCode::Closed,
            _ => ErrorCode::Io,
        };
        Self::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_means_success() {
        assert!(TransportError::from_raw(0).is_none());
        assert!(ErrorCode::from_raw(0).is_none());
    }

    #[test]
    fn raw_codes_are_non_zero_and_reversible() {
        for code in ErrorCode::ALL {
            assert_ne!(code.raw(), 0);
            assert_eq!(ErrorCode::from_raw(code.raw()), Some(code));
        }
    }

    #[test]
    fn unknown_raw_code_is_kept_as_io() {
        let err = TransportError::from_raw(4242).unwrap();
        assert_eq!(err.code(), ErrorCode::Io);
        assert!(err.detail().contains("4242"));
    }

    #[test]
    fn io_errors_keep_their_message() {
        let err = TransportError::from(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "nobody home",
        ));
        assert_eq!(err.code(), ErrorCode::ConnectionRefused);
        assert_eq!(err.detail(), "nobody home");
        assert_eq!(err.to_string(), "connection refused: nobody home");
    }

    #[test]
    fn cancellation_is_distinguished() {
        assert!(TransportError::canceled().is_canceled());
        assert!(TransportError::closed().is_teardown());
        assert!(!TransportError::timed_out().is_teardown());
        assert_eq!(TransportError::timed_out().to_string(), "timed out");
    }
}
