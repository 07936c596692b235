//! Configuration management for Tankobon.
//!
//! Handles loading, saving, and validating configuration from
//! platform-specific config directories.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name used for config and data directories.
const APP_NAME: &str = "Tankobon";

/// Default config filename.
const CONFIG_FILENAME: &str = "config.toml";

/// Default library filename inside the data directory.
const LIBRARY_FILENAME: &str = "library.json";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Reader and preloading behavior.
    pub reader: ReaderConfig,

    /// HTTP settings shared by all plugins.
    pub network: NetworkConfig,

    /// Persisted tracker credentials.
    pub trackers: TrackersConfig,

    /// File paths.
    pub paths: PathsConfig,
}

/// Reader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Only preload a limited number of pages ahead of the current one.
    pub restrict_preload_pages: bool,

    /// Number of pages to preload when restricted.
    pub preload_pages_amount: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            restrict_preload_pages: false,
            preload_pages_amount: 5,
        }
    }
}

impl ReaderConfig {
    /// Returns the preload window: `None` means every page of the chapter.
    pub fn preload_limit(&self) -> Option<usize> {
        self.restrict_preload_pages
            .then_some(self.preload_pages_amount)
    }
}

/// Network configuration for content sources and trackers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Per-request timeout in seconds; 0 disables the timeout.
    pub request_timeout_sec: u64,

    /// Delay before each request to the same site, in seconds.
    pub delay_between_requests_sec: f64,

    /// User-Agent header sent by every plugin.
    pub user_agent: String,

    /// Enable plugin debug logging.
    pub debug: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_sec: 30,
            delay_between_requests_sec: 0.0,
            user_agent: format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION")),
            debug: false,
        }
    }
}

impl NetworkConfig {
    /// Returns the request timeout, if one is configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_sec > 0).then(|| Duration::from_secs(self.request_timeout_sec))
    }
}

/// Tracker credentials and OAuth client settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackersConfig {
    pub kitsu: TrackerCredentials,
    pub anilist: TrackerCredentials,
}

/// Credentials for a single tracker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerCredentials {
    /// OAuth client id registered for this application.
    pub client_id: String,

    /// OAuth client secret, when the tracker requires one.
    pub client_secret: String,

    /// Access token from a previous session.
    pub access_token: Option<String>,
}

/// File path configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Library document; defaults to the platform data directory.
    pub library_file: Option<PathBuf>,

    /// Root directory served by the filesystem source.
    pub local_library: Option<PathBuf>,
}

impl Config {
    /// Returns the platform-specific config directory path.
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join(APP_NAME))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Returns the full path to the config file.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join(CONFIG_FILENAME))
    }

    /// Loads configuration from the default location.
    ///
    /// If the config file doesn't exist, creates a default one.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Config::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Ok(config)
    }

    /// Saves configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Saves configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reader.restrict_preload_pages && self.reader.preload_pages_amount == 0 {
            return Err(ConfigError::InvalidValue {
                key: "reader.preload_pages_amount".to_string(),
                message: "must be greater than 0 when preloading is restricted".to_string(),
            });
        }

        if !self.network.delay_between_requests_sec.is_finite()
            || self.network.delay_between_requests_sec < 0.0
        {
            return Err(ConfigError::InvalidValue {
                key: "network.delay_between_requests_sec".to_string(),
                message: "must be a non-negative number".to_string(),
            });
        }

        if self.network.user_agent.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "network.user_agent".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Returns the effective library file, using config or default.
    pub fn library_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(ref file) = self.paths.library_file {
            return Ok(file.clone());
        }
        dirs::data_dir()
            .map(|p| p.join(APP_NAME).join(LIBRARY_FILENAME))
            .ok_or(ConfigError::NoConfigDir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.reader.restrict_preload_pages);
        assert_eq!(config.reader.preload_limit(), None);
        assert_eq!(config.network.request_timeout(), Some(Duration::from_secs(30)));
        assert!(config.trackers.kitsu.access_token.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_preload_limit_when_restricted() {
        let reader = ReaderConfig {
            restrict_preload_pages: true,
            preload_pages_amount: 2,
        };
        assert_eq!(reader.preload_limit(), Some(2));
    }

    #[test]
    fn test_zero_timeout_disables() {
        let network = NetworkConfig {
            request_timeout_sec: 0,
            ..NetworkConfig::default()
        };
        assert_eq!(network.request_timeout(), None);
    }

    #[test]
    fn test_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.reader.restrict_preload_pages = true;
        config.reader.preload_pages_amount = 3;
        config.trackers.kitsu.access_token = Some("token".to_string());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.reader.preload_limit(), Some(3));
        assert_eq!(loaded.trackers.kitsu.access_token.as_deref(), Some("token"));
    }

    #[test]
    fn test_missing_file_creates_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.reader.preload_pages_amount, 5);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[reader]\nrestrict_preload_pages = true\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.reader.preload_limit(), Some(5));
        assert_eq!(config.network.request_timeout_sec, 30);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.reader.restrict_preload_pages = true;
        config.reader.preload_pages_amount = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.delay_between_requests_sec = -1.0;
        assert!(config.validate().is_err());
    }
}
