//! Offline trip bundles and app-update lifecycle for trip guides.
//!
//! The crate is organised leaf to root:
//!
//! - [`store`]: durable key/value storage with atomic replace
//! - [`api`]: REST client for the trip guide server
//! - [`fetcher`]: pulls the full content graph for one trip
//! - [`oracle`]: cheap per-trip content version lookups
//! - [`cache`]: the `CacheManager` orchestrating downloads and staleness
//! - [`worker`]: the bridge to the background update-delivery worker
//! - [`update`]: the `UpdateMonitor` driving check / apply / force refresh

pub mod api;
pub mod cache;
pub mod config;
pub mod fetcher;
pub mod models;
pub mod oracle;
pub mod store;
pub mod update;
pub mod utils;
pub mod worker;

pub use api::{ApiClient, ApiError};
pub use cache::{CacheError, CacheEvent, CacheManager, CacheSettings};
pub use config::Config;
pub use fetcher::{BundleSource, TripBundleFetcher};
pub use models::{Bundle, CacheStatus, DownloadProgress, TripCacheEntry, TripStatus, UpdateState};
pub use oracle::{VersionOracle, VersionSource};
pub use store::{FileStore, MemoryStore, PersistentStore, StoreError};
pub use update::{ApplyOutcome, UpdateError, UpdateMonitor, UpdateSettings};
pub use worker::{ReleaseFeedBridge, ServiceWorkerBridge};
