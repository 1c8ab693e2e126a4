//! Retrieval of the full content graph for one trip.
//!
//! A bundle is only useful offline if every section is present, so a fetch
//! either returns all seven sections or fails as a whole.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError};
use crate::models::{Bundle, BundleSection};

/// Progress callback, called with 0-100 as sections resolve
pub type ProgressFn<'a> = dyn Fn(u8) + Send + Sync + 'a;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to fetch {section}: {source}")]
    Section {
        section: BundleSection,
        #[source]
        source: ApiError,
    },

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait BundleSource: Send + Sync {
    /// Fetch every section of a trip. Progress is reported in proportion to
    /// the number of section categories resolved.
    async fn fetch_bundle(&self, trip_slug: &str, progress: &ProgressFn<'_>) -> Result<Bundle, FetchError>;
}

enum SectionData {
    Itinerary(Vec<crate::models::ItineraryDay>),
    Events(Vec<crate::models::TripEvent>),
    Talent(Vec<crate::models::Talent>),
    Faqs(Vec<crate::models::Faq>),
    InfoSections(Vec<crate::models::InfoSection>),
    Venues(Vec<crate::models::Venue>),
    Amenities(Vec<crate::models::Amenity>),
}

impl SectionData {
    fn apply(self, bundle: &mut Bundle) {
        match self {
            SectionData::Itinerary(v) => bundle.itinerary = v,
            SectionData::Events(v) => bundle.events = v,
            SectionData::Talent(v) => bundle.talent = v,
            SectionData::Faqs(v) => bundle.faqs = v,
            SectionData::InfoSections(v) => bundle.info_sections = v,
            SectionData::Venues(v) => bundle.venues = v,
            SectionData::Amenities(v) => bundle.amenities = v,
        }
    }
}

/// Fetches bundles section by section from the trip guide API.
#[derive(Clone)]
pub struct TripBundleFetcher {
    api: ApiClient,
}

impl TripBundleFetcher {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    async fn fetch_section(&self, slug: &str, section: BundleSection) -> Result<SectionData, FetchError> {
        let wrap = |source: ApiError| FetchError::Section { section, source };
        let data = match section {
            BundleSection::Itinerary => {
                SectionData::Itinerary(self.api.fetch_section(slug, section).await.map_err(wrap)?)
            }
            BundleSection::Events => {
                SectionData::Events(self.api.fetch_section(slug, section).await.map_err(wrap)?)
            }
            BundleSection::Talent => {
                SectionData::Talent(self.api.fetch_section(slug, section).await.map_err(wrap)?)
            }
            BundleSection::Faqs => {
                SectionData::Faqs(self.api.fetch_section(slug, section).await.map_err(wrap)?)
            }
            BundleSection::InfoSections => {
                SectionData::InfoSections(self.api.fetch_section(slug, section).await.map_err(wrap)?)
            }
            BundleSection::Venues => {
                SectionData::Venues(self.api.fetch_section(slug, section).await.map_err(wrap)?)
            }
            BundleSection::Amenities => {
                SectionData::Amenities(self.api.fetch_section(slug, section).await.map_err(wrap)?)
            }
        };
        Ok(data)
    }
}

#[async_trait]
impl BundleSource for TripBundleFetcher {
    async fn fetch_bundle(&self, trip_slug: &str, progress: &ProgressFn<'_>) -> Result<Bundle, FetchError> {
        info!(slug = trip_slug, "Fetching trip bundle");
        progress(0);

        let total = BundleSection::ALL.len();
        let mut pending: FuturesUnordered<_> = BundleSection::ALL
            .iter()
            .map(|&section| self.fetch_section(trip_slug, section))
            .collect();

        let mut bundle = Bundle::empty(trip_slug);
        let mut resolved = 0;
        while let Some(result) = pending.next().await {
            let data = match result {
                Ok(data) => data,
                Err(e) => {
                    if let FetchError::Section { section, source } = &e {
                        warn!(
                            slug = trip_slug,
                            %section,
                            transient = source.is_transient(),
                            error = %source,
                            "Section fetch failed, abandoning bundle"
                        );
                    }
                    // Returning early drops the remaining requests
                    return Err(e);
                }
            };
            data.apply(&mut bundle);
            resolved += 1;
            progress((resolved * 100 / total) as u8);
        }

        bundle.fetched_at = Utc::now();
        debug!(slug = trip_slug, records = bundle.total_records(), "Trip bundle complete");
        Ok(bundle)
    }
}
