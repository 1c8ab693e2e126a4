use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "ts")]
use ts_rs::TS;

/// App-update lifecycle state for one running session.
///
/// Never persisted; rebuilt from the live worker registration on start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct UpdateState {
    #[serde(rename = "lastChecked")]
    pub last_checked: Option<DateTime<Utc>>,
    /// When the currently running bundle was activated
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
    #[serde(rename = "updateAvailable")]
    pub update_available: bool,
    #[serde(rename = "isChecking")]
    pub is_checking: bool,
}

impl UpdateState {
    pub fn new(activated_at: DateTime<Utc>) -> Self {
        Self {
            last_checked: None,
            last_updated: activated_at,
            update_available: false,
            is_checking: false,
        }
    }
}
