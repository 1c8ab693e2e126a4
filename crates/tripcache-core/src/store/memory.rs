//! In-memory store backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::TripCacheEntry;

use super::{json_size, PersistentStore, StoreError, StoreResult, StoredRecord};

struct Slot {
    record: StoredRecord,
    size: u64,
}

/// Process-local store. Each key's record is swapped under a write lock, so
/// `put` is atomic with respect to `get`.
#[derive(Default)]
pub struct MemoryStore {
    slots: RwLock<HashMap<String, Slot>>,
    quota_bytes: Option<u64>,
    unavailable: AtomicBool,
    puts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Simulate the host denying storage access
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of successful `put` calls so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn used_bytes(&self) -> u64 {
        self.slots
            .read()
            .map(|slots| slots.values().map(|s| s.size).sum())
            .unwrap_or(0)
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::StorageUnavailable("storage access denied".to_string()))
        } else {
            Ok(())
        }
    }

    fn poisoned() -> StoreError {
        StoreError::StorageUnavailable("store lock poisoned".to_string())
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn put(&self, key: &str, value: &Value, metadata: &TripCacheEntry) -> StoreResult<()> {
        self.ensure_available()?;
        let size = json_size(value);

        let mut slots = self.slots.write().map_err(|_| Self::poisoned())?;
        if let Some(quota) = self.quota_bytes {
            // The record being replaced does not count against the new one
            let used: u64 = slots
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, s)| s.size)
                .sum();
            let available = quota.saturating_sub(used);
            if size > available {
                return Err(StoreError::QuotaExceeded { needed: size, available });
            }
        }

        slots.insert(
            key.to_string(),
            Slot {
                record: StoredRecord {
                    metadata: metadata.clone(),
                    value: value.clone(),
                },
                size,
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        self.ensure_available()?;
        let slots = self.slots.read().map_err(|_| Self::poisoned())?;
        Ok(slots.get(key).map(|s| s.record.value.clone()))
    }

    async fn list(&self) -> StoreResult<Vec<TripCacheEntry>> {
        self.ensure_available()?;
        let slots = self.slots.read().map_err(|_| Self::poisoned())?;
        Ok(slots.values().map(|s| s.record.metadata.clone()).collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.ensure_available()?;
        let mut slots = self.slots.write().map_err(|_| Self::poisoned())?;
        slots.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn entry(trip_id: i64, version: &str) -> TripCacheEntry {
        TripCacheEntry {
            trip_id,
            trip_slug: format!("trip-{}", trip_id),
            content_version: version.to_string(),
            downloaded_at: Utc::now(),
            size_bytes: 0,
        }
    }

    #[tokio::test]
    async fn test_put_replaces_whole_record() {
        let store = MemoryStore::new();
        store.put("k", &json!({"a": 1}), &entry(1, "v1")).await.unwrap();
        store.put("k", &json!({"b": 2}), &entry(1, "v2")).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(json!({"b": 2})));
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].content_version, "v2");
        assert_eq!(store.put_count(), 2);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.put("k", &json!([]), &entry(1, "v1")).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let store = MemoryStore::with_quota(20);
        store.put("a", &json!("0123456789"), &entry(1, "v1")).await.unwrap();

        let err = store
            .put("b", &json!("0123456789"), &entry(2, "v1"))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::QuotaExceeded { needed: 12, available: 8 });

        // Replacing an existing key only needs room for the new value
        store.put("a", &json!("01234567890123"), &entry(1, "v2")).await.unwrap();
        assert_eq!(store.used_bytes(), 16);
    }

    #[tokio::test]
    async fn test_unavailable_storage() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::StorageUnavailable(_))
        ));
        store.set_available(true);
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
