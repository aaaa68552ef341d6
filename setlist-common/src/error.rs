//! Common error types for setlist

use thiserror::Error;

use crate::ids::EntryId;
use crate::models::Capability;

/// Common result type for setlist operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the setlist crates
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request caught before it reaches the store
    #[error("Validation error: {0}")]
    Validation(String),

    /// Acting user lacks the capability a mutation requires
    #[error("Not authorized: requires {capability}")]
    Authorization { capability: Capability },

    /// Store refused a write the local gate allowed
    #[error("Rejected by store: {0}")]
    Denied(String),

    /// Store rejected a write made against a stale version
    #[error("Version conflict on entry {entry}")]
    Conflict { entry: EntryId },

    /// Transport failure talking to the backing store
    #[error("Network error: {0}")]
    Network(String),

    /// Store did not answer within the submission timeout
    #[error("Timed out waiting for the store")]
    Timeout,

    /// Event stream or heartbeat lost
    #[error("Connection to the store lost")]
    ConnectionLost,

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed TOML configuration file
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Internal invariant broken
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a user can reasonably try the same action again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout | Error::ConnectionLost | Error::Conflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_is_not_retryable() {
        let err = Error::Authorization {
            capability: Capability::ServiceEdit,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Not authorized: requires service-edit");
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Network("reset".to_string()).is_retryable());
        assert!(!Error::Validation("bad".to_string()).is_retryable());
    }
}
