use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Default buffer size for notification channels
pub const DEFAULT_CHANNEL_BUFFER: usize = 1000;

/// Default capacity of engine event hubs
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Sizing and pacing of one output engine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Rows requested per windowed fetch
    pub max_request_count: u64,
    /// Rows kept in memory; everything beyond is evicted
    pub max_stored_count: u64,
    /// Debounce before a windowed fetch fires
    pub request_delay_ms: u64,
    /// Minimum spacing between two preloads
    pub preload_throttle_ms: u64,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            max_request_count: 2000,
            max_stored_count: 2000,
            request_delay_ms: 0,
            preload_throttle_ms: 500,
        }
    }
}

impl OutputSettings {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn preload_throttle(&self) -> Duration {
        Duration::from_millis(self.preload_throttle_ms)
    }
}

/// Configuration for logframe
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Raw stream engine
    pub stream: OutputSettings,
    /// Search results engine
    pub search: OutputSettings,
    /// Capacity of every event hub
    pub event_capacity: Option<usize>,
    pub log: LogConfig,
}

impl Config {
    /// Defaults, then the user config file if present, then environment overrides
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit.map(Path::to_path_buf).or_else(Self::default_path);
        let mut config = match path {
            Some(path) if explicit.is_some() || path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// `$CONFIG_DIR/logframe/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("logframe").join("config.toml"))
    }

    pub fn event_capacity(&self) -> usize {
        self.event_capacity.unwrap_or(DEFAULT_EVENT_CAPACITY)
    }

    fn apply_env(&mut self) {
        if let Some(value) = env_number("LOGFRAME_MAX_STORED") {
            self.stream.max_stored_count = value;
            self.search.max_stored_count = value;
        }
        if let Some(value) = env_number("LOGFRAME_MAX_REQUEST") {
            self.stream.max_request_count = value;
            self.search.max_request_count = value;
        }
        if let Some(value) = env_number("LOGFRAME_REQUEST_DELAY_MS") {
            self.stream.request_delay_ms = value;
            self.search.request_delay_ms = value;
        }
        if let Ok(level) = std::env::var("LOGFRAME_LOG_LEVEL") {
            self.log.level = level;
        }
    }
}

fn env_number(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
