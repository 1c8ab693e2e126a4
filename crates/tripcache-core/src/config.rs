//! Application configuration.
//!
//! Stored at `~/.config/tripcache/config.json`. Every field is optional; a
//! missing or unreadable file yields the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::client::DEFAULT_BASE_URL;
use crate::cache::CacheSettings;
use crate::update::UpdateSettings;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "tripcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub download_timeout_secs: u64,
    pub version_timeout_secs: u64,
    pub update_check_timeout_secs: u64,
    pub activation_timeout_secs: u64,
    pub update_poll_minutes: Option<u64>,
    /// Upper bound for cached bundles on disk
    pub storage_quota_bytes: Option<u64>,
    pub last_trip_slug: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: None,
            download_timeout_secs: 120,
            version_timeout_secs: 10,
            update_check_timeout_secs: 15,
            activation_timeout_secs: 10,
            update_poll_minutes: None,
            storage_quota_bytes: None,
            last_trip_slug: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        match serde_json::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable config, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Root for cached bundles and log files
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Server base URL; `TRIPCACHE_API_URL` wins over the file.
    pub fn api_base_url(&self) -> String {
        std::env::var("TRIPCACHE_API_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .or_else(|| self.api_base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            download_timeout: Duration::from_secs(self.download_timeout_secs.max(1)),
            version_timeout: Duration::from_secs(self.version_timeout_secs.max(1)),
        }
    }

    pub fn update_settings(&self) -> UpdateSettings {
        UpdateSettings {
            check_timeout: Duration::from_secs(self.update_check_timeout_secs.max(1)),
            activation_timeout: Duration::from_secs(self.activation_timeout_secs.max(1)),
            poll_interval: self
                .update_poll_minutes
                .filter(|m| *m > 0)
                .map(|m| Duration::from_secs(m * 60)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.cache_settings().download_timeout, Duration::from_secs(120));
        assert!(config.update_settings().poll_interval.is_none());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"update_poll_minutes": 30, "last_trip_slug": "greek-isles-2025"}"#)
            .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.version_timeout_secs, 10);
        assert_eq!(config.last_trip_slug.as_deref(), Some("greek-isles-2025"));
        assert_eq!(
            config.update_settings().poll_interval,
            Some(Duration::from_secs(1800))
        );
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            storage_quota_bytes: Some(50 * 1024 * 1024),
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }
}
