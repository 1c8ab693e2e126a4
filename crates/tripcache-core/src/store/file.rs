//! Local filesystem store backend.
//!
//! Each key is one `<key>.json` file holding a `StoredRecord`. Writes go to a
//! uniquely-named temp file which is fsynced and then renamed over the
//! target, so readers only ever open a complete record.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::models::TripCacheEntry;

use super::{PersistentStore, StoreError, StoreResult, StoredRecord};

/// Record file extension
const RECORD_EXT: &str = "json";

/// Marker inside temp file names, swept on open
const TEMP_MARKER: &str = ".tmp.";

/// Maximum key length; keys become file names
const MAX_KEY_LENGTH: usize = 128;

#[derive(Deserialize)]
struct MetadataOnly {
    metadata: TripCacheEntry,
}

/// Directory-backed store.
pub struct FileStore {
    root: PathBuf,
    quota_bytes: Option<u64>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    /// Temp files left behind by interrupted writes are removed.
    pub async fn open(root: impl AsRef<Path>, quota_bytes: Option<u64>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| unavailable(&root, "create store directory", e))?;

        let store = Self { root, quota_bytes };
        store.sweep_temp_files().await?;
        debug!(root = ?store.root, "File store opened");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn sweep_temp_files(&self) -> StoreResult<()> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| unavailable(&self.root, "read store directory", e))?;
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| unavailable(&self.root, "read store directory", e))?
        {
            let name = item.file_name();
            if name.to_string_lossy().contains(TEMP_MARKER) {
                debug!(file = ?name, "Removing leftover temp file");
                let _ = fs::remove_file(item.path()).await;
            }
        }
        Ok(())
    }

    fn is_valid_key(key: &str) -> bool {
        !key.is_empty()
            && key.len() <= MAX_KEY_LENGTH
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    fn key_path(&self, key: &str) -> StoreResult<PathBuf> {
        if !Self::is_valid_key(key) {
            return Err(StoreError::StorageUnavailable(format!("invalid key: {:?}", key)));
        }
        Ok(self.root.join(format!("{}.{}", key, RECORD_EXT)))
    }

    /// Bytes used by every record except `except`
    async fn used_bytes_except(&self, except: &Path) -> StoreResult<u64> {
        let mut used = 0;
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| unavailable(&self.root, "read store directory", e))?;
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| unavailable(&self.root, "read store directory", e))?
        {
            let path = item.path();
            if path == except || !is_record_file(&path) {
                continue;
            }
            if let Ok(meta) = item.metadata().await {
                used += meta.len();
            }
        }
        Ok(used)
    }

    async fn read_record_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.key_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(&path, "read record", e)),
        }
    }
}

fn is_record_file(path: &Path) -> bool {
    let is_json = path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT);
    let is_temp = path
        .file_name()
        .map(|n| n.to_string_lossy().contains(TEMP_MARKER))
        .unwrap_or(false);
    is_json && !is_temp
}

fn unavailable(path: &Path, action: &str, e: std::io::Error) -> StoreError {
    StoreError::StorageUnavailable(format!("failed to {} at {}: {}", action, path.display(), e))
}

fn corrupt(key: &str, e: serde_json::Error) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn put(&self, key: &str, value: &Value, metadata: &TripCacheEntry) -> StoreResult<()> {
        let path = self.key_path(key)?;
        let record = StoredRecord {
            metadata: metadata.clone(),
            value: value.clone(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| corrupt(key, e))?;
        let needed = bytes.len() as u64;

        if let Some(quota) = self.quota_bytes {
            let available = quota.saturating_sub(self.used_bytes_except(&path).await?);
            if needed > available {
                return Err(StoreError::QuotaExceeded { needed, available });
            }
        }

        let temp_path = self
            .root
            .join(format!("{}.{}{}{:016x}", key, RECORD_EXT, TEMP_MARKER, rand::random::<u64>()));

        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&bytes).await?;
            // Flush to disk before the rename makes it visible
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        };

        if let Err(e) = write.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(if e.kind() == ErrorKind::StorageFull {
                StoreError::QuotaExceeded { needed, available: 0 }
            } else {
                unavailable(&path, "write record", e)
            });
        }

        debug!(key = key, bytes = needed, "Record written");
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        match self.read_record_bytes(key).await? {
            Some(bytes) => {
                let record: StoredRecord =
                    serde_json::from_slice(&bytes).map_err(|e| corrupt(key, e))?;
                Ok(Some(record.value))
            }
            None => Ok(None),
        }
    }

    async fn list(&self) -> StoreResult<Vec<TripCacheEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| unavailable(&self.root, "read store directory", e))?;
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| unavailable(&self.root, "read store directory", e))?
        {
            let path = item.path();
            if !is_record_file(&path) {
                continue;
            }
            let parsed = fs::read(&path)
                .await
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<MetadataOnly>(&bytes).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(record) => entries.push(record.metadata),
                Err(e) => warn!(file = ?path, error = %e, "Skipping unreadable record"),
            }
        }
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(&path, "delete record", e)),
        }
    }
}
