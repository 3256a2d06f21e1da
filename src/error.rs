//! Error Types for Account Receivers
//!
//! Every public operation of the account manager returns [`AccountError`].
//! Lower layers keep their own typed errors and are wrapped here without
//! losing the source.

use thiserror::Error;

use crate::address::EncodingError;
use crate::config::ConfigError;
use crate::derivation::DerivationError;
use crate::logging::LoggingError;
use crate::storage::StorageError;
use crate::types::Branch;

/// Root error type for account receivers
#[derive(Debug, Error)]
pub enum AccountError {
    /// Unknown account or alias
    #[error("account not found: {0}")]
    NotFound(String),

    /// Persistence or read failure in the storage collaborator
    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    /// Malformed key material or derivation path
    #[error("derivation error: {0}")]
    Derivation(#[from] DerivationError),

    /// Program could not be encoded as an address
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Caller cancelled the request before allocation committed
    #[error("request canceled")]
    Canceled,

    /// Caller deadline exceeded before allocation committed
    #[error("request timed out")]
    Timeout,

    /// No non-hardened index left on the branch
    #[error("derivation indices exhausted for account {account_id} on {branch} branch")]
    IndexExhausted { account_id: String, branch: Branch },

    /// Invalid caller input
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),
}

impl From<StorageError> for AccountError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => AccountError::NotFound(what),
            StorageError::Timeout(_) => AccountError::Timeout,
            other => AccountError::Storage(other),
        }
    }
}

impl AccountError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AccountError::Storage(_) | AccountError::Timeout | AccountError::Canceled
        )
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            AccountError::NotFound(_) => "NOT_FOUND",
            AccountError::Storage(_) => "STORAGE_ERROR",
            AccountError::Derivation(_) => "DERIVATION_ERROR",
            AccountError::Encoding(_) => "ENCODING_ERROR",
            AccountError::Canceled => "CANCELED",
            AccountError::Timeout => "TIMEOUT",
            AccountError::IndexExhausted { .. } => "INDEX_EXHAUSTED",
            AccountError::Validation(_) => "VALIDATION_ERROR",
            AccountError::Config(_) => "CONFIG_ERROR",
            AccountError::Logging(_) => "LOGGING_ERROR",
        }
    }
}

/// Result type alias using AccountError
pub type Result<T> = std::result::Result<T, AccountError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_not_found_maps_to_not_found() {
        let err: AccountError = StorageError::NotFound("acc-1".to_string()).into();
        assert!(matches!(err, AccountError::NotFound(ref id) if id == "acc-1"));
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[test]
    fn test_storage_failure_keeps_source() {
        let err: AccountError = StorageError::Database("disk full".to_string()).into();
        assert!(matches!(err, AccountError::Storage(StorageError::Database(_))));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_storage_timeout_maps_to_timeout() {
        let err: AccountError = StorageError::Timeout("database is locked".to_string()).into();
        assert!(matches!(err, AccountError::Timeout));
        assert_eq!(err.error_code(), "TIMEOUT");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(AccountError::Timeout.is_retryable());
        assert!(AccountError::Storage(StorageError::Connection("pool".into())).is_retryable());
        assert!(!AccountError::validation("bad quorum").is_retryable());
        assert!(!AccountError::NotFound("x".into()).is_retryable());
    }
}
