use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by `CacheManager` operations.
///
/// Cloneable so every caller joined to a coalesced download receives the
/// same outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Bundle download failed: {0}")]
    BundleFetchFailed(String),

    #[error("Not enough storage: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Cached bundle for trip {trip_id} is unreadable: {reason}")]
    Corrupt { trip_id: i64, reason: String },

    #[error("Download for trip {trip_id} was cancelled")]
    Cancelled { trip_id: i64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    pub(crate) fn from_store(trip_id: i64, err: StoreError) -> Self {
        match err {
            StoreError::QuotaExceeded { needed, available } => {
                CacheError::QuotaExceeded { needed, available }
            }
            StoreError::StorageUnavailable(reason) => CacheError::StorageUnavailable(reason),
            StoreError::Corrupt { reason, .. } => CacheError::Corrupt { trip_id, reason },
        }
    }
}
