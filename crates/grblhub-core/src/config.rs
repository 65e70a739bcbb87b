//! Bridge configuration.
//!
//! A small read-only configuration loaded once at startup from a TOML file.
//! Carries the extra port names advertised by `list` alongside the ports the
//! OS enumerates, plus the two session timer intervals.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// CNC-specific settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CncSettings {
    /// Extra port device names to advertise in `list` (e.g. ports the OS
    /// enumeration misses, such as on-board UARTs).
    #[serde(default)]
    pub ports: Vec<String>,
}

/// Session timer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Interval between controller status polls in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub status_poll_ms: u64,
    /// Interval between queue progress checks in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub queue_report_ms: u64,
}

fn default_interval_ms() -> u64 {
    250
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            status_poll_ms: default_interval_ms(),
            queue_report_ms: default_interval_ms(),
        }
    }
}

/// Top-level bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// CNC settings (`[cnc]` section).
    #[serde(default)]
    pub cnc: CncSettings,
    /// Timer settings (`[timing]` section).
    #[serde(default)]
    pub timing: TimingSettings,
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(config)
    }
}
