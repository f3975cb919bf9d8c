//! Error types for btcp sockets and servers.

use std::fmt::Display;
use std::io;

use thiserror::Error;

/// Errors reported by sockets and servers.
///
/// The type is `Clone` so that it can be delivered through `error` events as
/// well as returned from the call that failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// The server could not bind or listen on the requested endpoint.
    #[error("failed to listen on {address}: {message}")]
    Bind {
        /// The endpoint that was requested.
        address: String,
        /// The underlying I/O error kind.
        kind: io::ErrorKind,
        /// Human-readable cause.
        message: String,
    },

    /// The peer was unreachable, refused the connection, or timed out.
    #[error("failed to connect to {address}: {message}")]
    Connect {
        /// The endpoint that was dialed.
        address: String,
        /// The underlying I/O error kind.
        kind: io::ErrorKind,
        /// Human-readable cause.
        message: String,
    },

    /// A read, write or shutdown failed after the connection was established.
    #[error("transport I/O error: {message}")]
    TransportIo {
        /// The underlying I/O error kind.
        kind: io::ErrorKind,
        /// Human-readable cause.
        message: String,
    },

    /// The operation is not permitted in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the socket or server was in.
        state: String,
    },

    /// Callback and iteration consumers were mixed, or two pulls overlapped.
    #[error("consumer conflict: {0}")]
    ConsumerConflict(&'static str),
}

impl SocketError {
    pub(crate) fn bind(address: impl Into<String>, err: &io::Error) -> Self {
        Self::Bind {
            address: address.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub(crate) fn connect(address: impl Into<String>, err: &io::Error) -> Self {
        Self::Connect {
            address: address.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub(crate) fn transport(err: &io::Error) -> Self {
        Self::TransportIo {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub(crate) fn invalid_state(operation: &'static str, state: impl Display) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// The I/O error kind behind this error, for I/O-backed variants.
    pub fn kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Bind { kind, .. } | Self::Connect { kind, .. } | Self::TransportIo { kind, .. } => {
                Some(*kind)
            }
            Self::InvalidState { .. } | Self::ConsumerConflict(_) => None,
        }
    }

    /// Whether this error reports API misuse rather than a network failure.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Self::InvalidState { .. } | Self::ConsumerConflict(_))
    }
}

/// A specialized Result type for btcp operations.
pub type Result<T> = std::result::Result<T, SocketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_backed_errors_keep_kind() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = SocketError::connect("127.0.0.1:1", &refused);

        assert_eq!(err.kind(), Some(io::ErrorKind::ConnectionRefused));
        assert!(!err.is_usage_error());
        assert!(err.to_string().contains("127.0.0.1:1"));
    }

    #[test]
    fn test_usage_errors_have_no_kind() {
        let err = SocketError::invalid_state("write", "LocalClosed");
        assert_eq!(err.kind(), None);
        assert!(err.is_usage_error());
        assert_eq!(err.to_string(), "cannot write while LocalClosed");

        let conflict = SocketError::ConsumerConflict("data callbacks are attached");
        assert!(conflict.is_usage_error());
    }
}
