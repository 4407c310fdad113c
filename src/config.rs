// src/config.rs

use crate::naming::MediaTypes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Settings shared by the registry and every worker it spawns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory every local name is resolved under.
    pub download_dir: PathBuf,
    /// Size of each read from the remote body.
    pub buffer_size: usize,
    /// Progress notifications are emitted at most once per this many bytes.
    pub notify_every_bytes: u64,
    /// How often a paused worker re-checks its flags.
    #[serde(with = "millis")]
    pub pause_poll_interval: Duration,
    /// Only bounds connection setup. Body reads have no deadline.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub media_types: MediaTypes,
    /// Capacity of the event channel. Slow observers skip events.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            buffer_size: 1024,
            notify_every_bytes: 64 * 1024,
            pause_poll_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(30),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            media_types: MediaTypes::default(),
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config file. Missing keys take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be greater than zero"));
        }
        if self.pause_poll_interval.is_zero() {
            return Err(ConfigError::Invalid("pause_poll_interval must be greater than zero"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be greater than zero"));
        }
        if self.media_types.fallback_extension.trim().is_empty() {
            return Err(ConfigError::Invalid("media_types.fallback_extension must not be empty"));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
