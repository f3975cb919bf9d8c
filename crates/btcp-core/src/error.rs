//! Error types for btcp-core.

use std::fmt;

/// Signal-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// A latched signal was emitted a second time.
    AlreadyFired,
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyFired => write!(f, "Signal has already fired"),
        }
    }
}

impl std::error::Error for SignalError {}
