//! Error types for the asset ledger

use crate::types::TokenAmount;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
///
/// `PermissionDenied` and `InvalidTransition` are terminal for the caller.
/// `ExternalCallFailed` is safe to retry: every mutating operation is
/// idempotent on its natural key.
#[derive(Error, Debug)]
pub enum Error {
    /// Authorization failed
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// State machine precondition violated
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Balance too low for a burn, transfer or trade
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Amount requested
        required: TokenAmount,
        /// Amount held
        available: TokenAmount,
    },

    /// Persistence or chain collaborator unavailable or timed out
    #[error("External call failed: {0}")]
    ExternalCallFailed(String),

    /// Chain collaborator rejected the call
    #[error("Reverted by ledger: {0}")]
    Reverted(String),

    /// Record not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind
        kind: &'static str,
        /// Record identifier
        id: String,
    },

    /// Malformed request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invariant violation (conservation, overflow, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Shorthand for a missing record
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ExternalCallFailed(_))
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::ExternalCallFailed(format!("storage: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_external_failures_are_retryable() {
        assert!(Error::ExternalCallFailed("timeout".into()).is_retryable());
        assert!(!Error::PermissionDenied("no".into()).is_retryable());
        assert!(!Error::Reverted("insufficient".into()).is_retryable());
        assert!(!Error::InsufficientBalance {
            required: 150,
            available: 100
        }
        .is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::InsufficientBalance {
            required: 150,
            available: 100,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient balance: required 150, available 100"
        );
        assert_eq!(
            Error::not_found("Deposit", "abc").to_string(),
            "Deposit not found: abc"
        );
    }
}
