use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The section categories that make up a trip bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleSection {
    Itinerary,
    Events,
    Talent,
    Faqs,
    InfoSections,
    Venues,
    Amenities,
}

impl BundleSection {
    pub const ALL: [BundleSection; 7] = [
        BundleSection::Itinerary,
        BundleSection::Events,
        BundleSection::Talent,
        BundleSection::Faqs,
        BundleSection::InfoSections,
        BundleSection::Venues,
        BundleSection::Amenities,
    ];

    /// Path segment under `/api/trips/{slug}/`
    pub fn path(&self) -> &'static str {
        match self {
            BundleSection::Itinerary => "itinerary",
            BundleSection::Events => "events",
            BundleSection::Talent => "talent",
            BundleSection::Faqs => "faqs",
            BundleSection::InfoSections => "info-sections",
            BundleSection::Venues => "venues",
            BundleSection::Amenities => "amenities",
        }
    }
}

impl std::fmt::Display for BundleSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleSection::Itinerary => write!(f, "Itinerary"),
            BundleSection::Events => write!(f, "Events"),
            BundleSection::Talent => write!(f, "Talent"),
            BundleSection::Faqs => write!(f, "FAQs"),
            BundleSection::InfoSections => write!(f, "Info Sections"),
            BundleSection::Venues => write!(f, "Venues"),
            BundleSection::Amenities => write!(f, "Amenities"),
        }
    }
}

// Records keep the handful of fields the client relies on and carry every
// other server field through `extra`, so a cached bundle renders the same as
// the live API even when the server grows new fields.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItineraryDay {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "dayNumber", default)]
    pub day_number: Option<i32>,
    pub date: Option<String>,
    #[serde(rename = "portName", alias = "location", default)]
    pub port_name: Option<String>,
    #[serde(rename = "arrivalTime", default)]
    pub arrival_time: Option<String>,
    #[serde(rename = "departureTime", default)]
    pub departure_time: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TripEvent {
    #[serde(default)]
    pub id: i64,
    pub title: String,
    pub date: Option<String>,
    pub time: Option<String>,
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(rename = "venueId", default)]
    pub venue_id: Option<i64>,
    #[serde(rename = "talentIds", default)]
    pub talent_ids: Vec<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Talent {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub category: Option<String>,
    pub bio: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Faq {
    #[serde(default)]
    pub id: i64,
    pub question: String,
    pub answer: String,
    #[serde(rename = "orderIndex", default)]
    pub order_index: i32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfoSection {
    #[serde(default)]
    pub id: i64,
    pub title: String,
    pub content: Option<String>,
    #[serde(rename = "orderIndex", default)]
    pub order_index: i32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Venue {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(rename = "venueType", alias = "venueTypeName", default)]
    pub venue_type: Option<String>,
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Amenity {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Full offline-renderable snapshot of one trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bundle {
    #[serde(rename = "tripSlug")]
    pub trip_slug: String,
    #[serde(rename = "fetchedAt")]
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub itinerary: Vec<ItineraryDay>,
    #[serde(default)]
    pub events: Vec<TripEvent>,
    #[serde(default)]
    pub talent: Vec<Talent>,
    #[serde(default)]
    pub faqs: Vec<Faq>,
    #[serde(rename = "infoSections", default)]
    pub info_sections: Vec<InfoSection>,
    #[serde(default)]
    pub venues: Vec<Venue>,
    #[serde(default)]
    pub amenities: Vec<Amenity>,
}

impl Bundle {
    pub fn empty(trip_slug: &str) -> Self {
        Self {
            trip_slug: trip_slug.to_string(),
            fetched_at: Utc::now(),
            itinerary: Vec::new(),
            events: Vec::new(),
            talent: Vec::new(),
            faqs: Vec::new(),
            info_sections: Vec::new(),
            venues: Vec::new(),
            amenities: Vec::new(),
        }
    }

    /// Number of records in a section
    pub fn section_len(&self, section: BundleSection) -> usize {
        match section {
            BundleSection::Itinerary => self.itinerary.len(),
            BundleSection::Events => self.events.len(),
            BundleSection::Talent => self.talent.len(),
            BundleSection::Faqs => self.faqs.len(),
            BundleSection::InfoSections => self.info_sections.len(),
            BundleSection::Venues => self.venues.len(),
            BundleSection::Amenities => self.amenities.len(),
        }
    }

    pub fn total_records(&self) -> usize {
        BundleSection::ALL.iter().map(|s| self.section_len(*s)).sum()
    }
}
