//! Durable key/value storage for trip bundles.
//!
//! A store keeps one record per key: the bundle payload plus the
//! `TripCacheEntry` describing it. Records are replaced as a whole, so a
//! reader never observes a payload from one download paired with metadata
//! from another.
//!
//! Two backends are provided:
//! - `MemoryStore`: process-local map, used by tests and ephemeral sessions
//! - `FileStore`: one JSON file per key, written via temp file + rename

pub mod error;
pub mod file;
pub mod memory;

use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::TripCacheEntry;

pub use error::{StoreError, StoreResult};
pub use file::FileStore;
pub use memory::MemoryStore;

/// A committed record: payload and the metadata describing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub metadata: TripCacheEntry,
    pub value: Value,
}

#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Replace the record under `key`. Readers see the old record or the new
    /// one, never a mix.
    async fn put(&self, key: &str, value: &Value, metadata: &TripCacheEntry) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Metadata of every committed record
    async fn list(&self) -> StoreResult<Vec<TripCacheEntry>>;

    /// Remove a record. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Bytes `value` occupies once persisted
    fn estimate_size(&self, value: &Value) -> u64 {
        json_size(value)
    }
}

/// Compact JSON length of `value`, measured without buffering it.
pub fn json_size(value: &Value) -> u64 {
    let mut counter = ByteCounter(0);
    // Writing into the counter cannot fail
    let _ = serde_json::to_writer(&mut counter, value);
    counter.0
}

struct ByteCounter(u64);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_size_matches_serialized_length() {
        let value = json!({"tripSlug": "greek-isles-2025", "faqs": [{"q": "ünïcode"}]});
        let expected = serde_json::to_vec(&value).unwrap().len() as u64;
        assert_eq!(json_size(&value), expected);
    }
}
