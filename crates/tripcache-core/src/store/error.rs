//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
///
/// Both variants the caller can act on (quota, availability) are reported
/// as-is; stores never retry internally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Result type for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
