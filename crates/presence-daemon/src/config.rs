//! Configuration loading

use anyhow::{Context, Result};
use presence_core::Device;
use presence_discovery::{PresenceConfig, TrackerSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub events: EventsConfig,
    /// Tracker name to tracker settings
    #[serde(default)]
    pub trackers: BTreeMap<String, TrackerSettings>,
    /// Devices known at startup
    #[serde(default, rename = "device")]
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Print events as JSON lines on stdout instead of only logging them
    #[serde(default)]
    pub enabled: bool,
    /// Events buffered for a slow consumer before the oldest are dropped
    #[serde(default = "default_buffer")]
    pub buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            buffer: default_buffer(),
        }
    }
}

fn default_buffer() -> usize {
    256
}

/// Load configuration from file, falling back to defaults when it doesn't exist
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!(
            path = %path.display(),
            devices = config.devices.len(),
            trackers = config.trackers.len(),
            "Loaded configuration"
        );
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}
