//! API client for the trip guide REST API.
//!
//! Read-only endpoints used by the offline subsystem:
//! per-section trip content, the per-trip content version, and the app
//! release feed.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, warn};

use crate::models::BundleSection;

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Default server when no base URL is configured
pub const DEFAULT_BASE_URL: &str = "http://localhost:3001";

/// HTTP request timeout in seconds.
/// Bounds a single request; whole-bundle timeouts are applied by the caller.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Maximum trip slug length accepted in request paths
const MAX_SLUG_LENGTH: usize = 128;

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(alias = "contentVersion", alias = "content_version")]
    version: Option<String>,
    #[serde(rename = "updatedAt", default)]
    updated_at: Option<String>,
}

/// Release information published by the server for the app shell.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AppRelease {
    pub version: String,
    #[serde(rename = "releasedAt", default)]
    pub released_at: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// API client for the trip guide server.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Arc<str>,
    initial_backoff: Duration,
}

impl ApiClient {
    /// Create a new API client rooted at `base_url`
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Trip slugs are lowercase ASCII letters, digits, dashes and underscores.
    pub fn is_valid_slug(slug: &str) -> bool {
        !slug.is_empty()
            && slug.len() <= MAX_SLUG_LENGTH
            && slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    }

    fn trip_url(&self, slug: &str, tail: &str) -> Result<String, ApiError> {
        if !Self::is_valid_slug(slug) {
            return Err(ApiError::InvalidSlug(slug.to_string()));
        }
        Ok(format!("{}/api/trips/{}/{}", self.base_url, slug, tail))
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, ApiError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = self
                .client
                .get(url)
                .header(header::ACCEPT, "application/json")
                .send()
                .await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    let text = response.text().await?;
                    return serde_json::from_str(&text).map_err(|e| {
                        ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", url, e))
                    });
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2; // Exponential backoff
                }
            }
        }
    }

    // ===== Data Fetching Methods =====

    /// Fetch one bundle section for a trip
    pub async fn fetch_section<T: DeserializeOwned>(
        &self,
        slug: &str,
        section: BundleSection,
    ) -> Result<Vec<T>, ApiError> {
        let url = self.trip_url(slug, section.path())?;
        let records: Vec<T> = self.get(&url).await?;
        debug!(slug = slug, section = %section, count = records.len(), "Section fetched");
        Ok(records)
    }

    /// Fetch the opaque content version signature for a trip.
    /// Falls back to `updatedAt` when the server only reports a timestamp.
    pub async fn fetch_trip_version(&self, slug: &str) -> Result<String, ApiError> {
        let url = self.trip_url(slug, "version")?;
        let response: VersionResponse = self.get(&url).await?;
        response
            .version
            .or(response.updated_at)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::InvalidResponse(format!("No version reported for trip {}", slug)))
    }

    /// Fetch the newest published app release
    pub async fn fetch_app_release(&self) -> Result<AppRelease, ApiError> {
        let url = format!("{}/api/app/version", self.base_url);
        self.get(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_slugs() {
        assert!(ApiClient::is_valid_slug("greek-isles-2025"));
        assert!(ApiClient::is_valid_slug("drag_stars_at_sea"));
        assert!(!ApiClient::is_valid_slug(""));
        assert!(!ApiClient::is_valid_slug("../admin"));
        assert!(!ApiClient::is_valid_slug("Greek Isles"));
        assert!(!ApiClient::is_valid_slug(&"a".repeat(MAX_SLUG_LENGTH + 1)));
    }

    #[test]
    fn test_trip_url_building() {
        let api = ApiClient::new("https://guides.example.com/").unwrap();
        assert_eq!(api.base_url(), "https://guides.example.com");
        assert_eq!(
            api.trip_url("greek-isles-2025", BundleSection::InfoSections.path()).unwrap(),
            "https://guides.example.com/api/trips/greek-isles-2025/info-sections"
        );
        assert!(matches!(api.trip_url("bad slug", "version"), Err(ApiError::InvalidSlug(_))));
    }

    #[test]
    fn test_version_response_aliases() {
        let a: VersionResponse = serde_json::from_str(r#"{"contentVersion":"abc"}"#).unwrap();
        assert_eq!(a.version.as_deref(), Some("abc"));
        let b: VersionResponse = serde_json::from_str(r#"{"updatedAt":"2025-06-01T00:00:00Z"}"#).unwrap();
        assert!(b.version.is_none());
        assert_eq!(b.updated_at.as_deref(), Some("2025-06-01T00:00:00Z"));
    }

    fn rate_limit_tolerant(url: &str) -> ApiClient {
        ApiClient::new(url)
            .unwrap()
            .with_initial_backoff(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_rate_limited_request_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("GET", "/api/app/version")
            .with_status(429)
            .expect(2)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/api/app/version")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"version":"1.5.0","releasedAt":"2025-06-01T00:00:00Z"}"#)
            .create_async()
            .await;

        let release = rate_limit_tolerant(&server.url()).fetch_app_release().await.unwrap();
        assert_eq!(release.version, "1.5.0");
        assert_eq!(release.released_at.as_deref(), Some("2025-06-01T00:00:00Z"));
        limited.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limit_gives_up_after_retries() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("GET", "/api/app/version")
            .with_status(429)
            .expect(MAX_RATE_LIMIT_RETRIES as usize + 1)
            .create_async()
            .await;

        let err = rate_limit_tolerant(&server.url()).fetch_app_release().await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited));
        assert!(err.is_transient());
        limited.assert_async().await;
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let missing = server
            .mock("GET", "/api/trips/atlantis/version")
            .with_status(404)
            .with_body("no such trip")
            .expect(1)
            .create_async()
            .await;

        let err = rate_limit_tolerant(&server.url())
            .fetch_trip_version("atlantis")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(ref body) if body == "no such trip"));
        missing.assert_async().await;
    }
}
