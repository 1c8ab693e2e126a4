//! Data models for offline trip guides.
//!
//! This module contains the data structures shared across the crate:
//!
//! - `Bundle` and its section records: the offline snapshot of one trip
//! - `TripCacheEntry`, `CacheStatus`, `TripStatus`: per-trip cache metadata
//! - `DownloadProgress`: progress of the current download session
//! - `UpdateState`: the app-update lifecycle as seen by the UI

pub mod bundle;
pub mod offline;
pub mod update;

pub use bundle::{
    Amenity, Bundle, BundleSection, Faq, InfoSection, ItineraryDay, Talent, TripEvent, Venue,
};
pub use offline::{CacheStatus, DownloadProgress, TripCacheEntry, TripStatus};
pub use update::UpdateState;
