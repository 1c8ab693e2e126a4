use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "ts")]
use ts_rs::TS;

use crate::utils::format_age;

/// Metadata committed alongside a trip's bundle.
///
/// At most one entry exists per `trip_id`; a successful download replaces
/// the previous entry and payload in a single store write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct TripCacheEntry {
    #[serde(rename = "tripId")]
    pub trip_id: i64,
    #[serde(rename = "tripSlug")]
    pub trip_slug: String,
    #[serde(rename = "contentVersion")]
    pub content_version: String,
    #[serde(rename = "downloadedAt")]
    pub downloaded_at: DateTime<Utc>,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
}

impl TripCacheEntry {
    /// Storage key for a trip's bundle
    pub fn store_key(trip_id: i64) -> String {
        format!("trip-bundle-{}", trip_id)
    }

    pub fn status(&self) -> TripStatus {
        TripStatus {
            downloaded_at: self.downloaded_at,
            size_bytes: self.size_bytes,
        }
    }

    pub fn age_display(&self) -> String {
        format_age(self.downloaded_at, Utc::now())
    }
}

/// Summary shown in the settings page for a downloaded trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct TripStatus {
    #[serde(rename = "downloadedAt")]
    pub downloaded_at: DateTime<Utc>,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
}

/// Offline state of a single trip.
///
/// Only committed entries are persisted. `Stale` is derived from the last
/// version comparison and `Failed` only appears transiently in change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Absent,
    Downloading,
    Ready,
    Stale,
    Failed,
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStatus::Absent => write!(f, "Not downloaded"),
            CacheStatus::Downloading => write!(f, "Downloading"),
            CacheStatus::Ready => write!(f, "Ready"),
            CacheStatus::Stale => write!(f, "Update available"),
            CacheStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Global download progress: the newest session still running, else the
/// last one to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct DownloadProgress {
    #[serde(rename = "tripId")]
    pub trip_id: Option<i64>,
    pub percent: u8,
    #[serde(rename = "isDownloading")]
    pub is_downloading: bool,
}
