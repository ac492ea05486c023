//! Per-instance configuration loaded from `<game>/CKAN/config.toml`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ckan_schema::GameVersion;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::comparator::{CompatibilityMode, GameComparator};
use crate::io::download::DownloadBackend;
use crate::resolver::ResolverOptions;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Which download backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Pick by host platform.
    #[default]
    Auto,
    Native,
    Threaded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub compatibility: CompatibilityMode,
    pub with_recommends: bool,
    pub with_suggests: bool,
    pub allow_incompatible: bool,
    pub conflicts_as_warnings: bool,
    pub download_backend: BackendChoice,
    /// Minimum seconds between progress reports for a single file.
    pub progress_interval_secs: u64,
    /// Overrides the game version when set.
    pub game_version: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compatibility: CompatibilityMode::Gras,
            with_recommends: true,
            with_suggests: false,
            allow_incompatible: false,
            conflicts_as_warnings: false,
            download_backend: BackendChoice::Auto,
            progress_interval_secs: 3,
            game_version: None,
        }
    }
}

impl Config {
    /// Reads the config file if present, then applies `CKAN_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or an override is invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            Self::from_toml_str(&std::fs::read_to_string(path)?)?
        } else {
            Self::default()
        };
        config.with_overrides(
            std::env::var("CKAN_COMPATIBILITY").ok().as_deref(),
            std::env::var("CKAN_GAME_VERSION").ok().as_deref(),
        )
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Applies explicit overrides on top of the file values.
    pub fn with_overrides(
        mut self,
        compatibility: Option<&str>,
        game_version: Option<&str>,
    ) -> Result<Self, ConfigError> {
        if let Some(mode) = compatibility {
            self.compatibility = mode.parse().map_err(ConfigError::Invalid)?;
        }
        if let Some(version) = game_version {
            self.game_version = Some(version.to_string());
        }
        self.parsed_game_version()?;
        Ok(self)
    }

    /// The configured game version, if any.
    pub fn parsed_game_version(&self) -> Result<Option<GameVersion>, ConfigError> {
        self.game_version
            .as_deref()
            .map(|v| GameVersion::parse(v).map_err(|e| ConfigError::Invalid(e.to_string())))
            .transpose()
    }

    pub fn comparator(&self) -> Arc<dyn GameComparator> {
        self.compatibility.comparator()
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            with_recommends: self.with_recommends,
            with_suggests: self.with_suggests,
            allow_incompatible: self.allow_incompatible,
            conflicts_as_warnings: self.conflicts_as_warnings,
        }
    }

    pub fn backend(&self) -> DownloadBackend {
        match self.download_backend {
            BackendChoice::Auto => DownloadBackend::for_host(),
            BackendChoice::Native => DownloadBackend::Native,
            BackendChoice::Threaded => DownloadBackend::Threaded,
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.compatibility, CompatibilityMode::Gras);
        assert!(config.with_recommends);
        assert!(!config.with_suggests);
        assert_eq!(config.progress_interval(), Duration::from_secs(3));
        assert_eq!(config.backend(), DownloadBackend::for_host());
    }

    #[test]
    fn test_parse_file() {
        let config = Config::from_toml_str(
            r#"
            compatibility = "strict"
            with_suggests = true
            download_backend = "threaded"
            game_version = "1.0.4"
            "#,
        )
        .unwrap();
        assert_eq!(config.compatibility, CompatibilityMode::Strict);
        assert!(config.resolver_options().with_suggests);
        assert_eq!(config.backend(), DownloadBackend::Threaded);
        assert_eq!(config.parsed_game_version().unwrap(), Some(GameVersion::new(1, 0, 4)));
    }

    #[test]
    fn test_overrides() {
        let config = Config::default()
            .with_overrides(Some("yoyo"), Some("1.1"))
            .unwrap();
        assert_eq!(config.compatibility, CompatibilityMode::Yoyo);
        assert_eq!(config.game_version.as_deref(), Some("1.1"));

        assert!(Config::default().with_overrides(Some("nope"), None).is_err());
        assert!(Config::default().with_overrides(None, Some("one.two")).is_err());
    }
}
