//! Lightweight content version lookups.
//!
//! A version is an opaque string (hash or max-updated-at on the server);
//! the only operation defined on it is equality.

use async_trait::async_trait;
use tracing::debug;

use crate::api::{ApiClient, ApiError};

#[async_trait]
pub trait VersionSource: Send + Sync {
    /// Current content version of a trip, one round trip
    async fn get_version(&self, trip_slug: &str) -> Result<String, ApiError>;
}

/// Version lookups against `GET /api/trips/{slug}/version`.
#[derive(Clone)]
pub struct VersionOracle {
    api: ApiClient,
}

impl VersionOracle {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl VersionSource for VersionOracle {
    async fn get_version(&self, trip_slug: &str) -> Result<String, ApiError> {
        let version = self.api.fetch_trip_version(trip_slug).await?;
        debug!(slug = trip_slug, version = %version, "Content version fetched");
        Ok(version)
    }
}
