//! Offline trip caching.
//!
//! This module provides the `CacheManager`, which owns the per-trip cache
//! entries and orchestrates downloads:
//!
//! - version lookup, bundle fetch and a single atomic store commit
//! - coalescing of concurrent downloads of the same trip
//! - cancellation of in-flight downloads when a trip is removed
//! - staleness checks against the server's current content version
//! - progress and status notifications for UI binding

pub mod error;
pub mod manager;

pub use error::CacheError;
pub use manager::{CacheEvent, CacheManager, CacheSettings};
