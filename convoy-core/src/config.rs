use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level Convoy configuration, matching `convoy.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvoyConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub scheduling: SchedulingSection,
}

impl ConvoyConfig {
    /// Load configuration from `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::NotFound(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduling.wave_size == 0 {
            return Err(ConfigError::Invalid(
                "scheduling.wave_size must be at least 1".into(),
            ));
        }
        if self.scheduling.max_waves == 0 {
            return Err(ConfigError::Invalid(
                "scheduling.max_waves must be at least 1".into(),
            ));
        }
        if self.discovery.stuck_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "discovery.stuck_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".convoy/convoy.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// Age after which an `in_progress` run is considered crashed.
    pub stuck_timeout_secs: u64,
    /// Reclaim stuck runs when the store is opened by a long-lived process.
    pub recover_on_startup: bool,
}

impl DiscoverySection {
    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            stuck_timeout_secs: 2 * 60 * 60,
            recover_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingSection {
    /// Maximum repositories per wave.
    pub wave_size: usize,
    /// Hard cap on the number of waves a plan may contain.
    pub max_waves: usize,
    /// Default number of pilot candidates to surface.
    pub pilot_count: usize,
}

impl Default for SchedulingSection {
    fn default() -> Self {
        Self {
            wave_size: 10,
            max_waves: 100,
            pilot_count: 10,
        }
    }
}
