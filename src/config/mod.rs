pub mod validation;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TagError;
use crate::stream::DemuxOptions;
use crate::tags::{ExtractionTags, DEFAULT_START_TAG};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid tag configuration: {0}")]
    Tag(#[from] TagError),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterpreterConfig {
    #[serde(default)]
    pub tags: TagsConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Reasoning and final-answer tag names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagsConfig {
    #[serde(default = "default_start_tag")]
    pub start: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

impl TagsConfig {
    /// # Errors
    ///
    /// Returns [`TagError`] when a name is invalid or both names are equal.
    pub fn extraction_tags(&self) -> Result<ExtractionTags, TagError> {
        ExtractionTags::new(self.start.clone(), self.end.clone())
    }
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            start: default_start_tag(),
            end: None,
        }
    }
}

/// Session map sizing and idle expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionsConfig {
    pub shard_count: usize,
    /// `None` disables idle expiry.
    pub idle_timeout_secs: Option<u64>,
    pub reaper_interval_secs: u64,
    pub retired_id_capacity: usize,
}

#[derive(Debug, Deserialize)]
struct SessionsConfigWire {
    #[serde(default = "default_shard_count")]
    shard_count: usize,
    #[serde(default = "default_idle_timeout_wire")]
    idle_timeout_secs: Option<u64>,
    #[serde(default = "default_reaper_interval_secs")]
    reaper_interval_secs: u64,
    #[serde(default = "default_retired_id_capacity")]
    retired_id_capacity: usize,
}

impl<'de> Deserialize<'de> for SessionsConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = SessionsConfigWire::deserialize(deserializer)?;
        Ok(Self {
            shard_count: wire.shard_count,
            // missing => default, explicit null or 0 => disabled
            idle_timeout_secs: wire.idle_timeout_secs.filter(|secs| *secs > 0),
            reaper_interval_secs: wire.reaper_interval_secs,
            retired_id_capacity: wire.retired_id_capacity,
        })
    }
}

impl SessionsConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    #[must_use]
    pub fn demux_options(&self) -> DemuxOptions {
        DemuxOptions {
            shard_count: self.shard_count,
            retired_id_capacity: self.retired_id_capacity,
            idle_timeout: self.idle_timeout(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            idle_timeout_secs: default_idle_timeout_wire(),
            reaper_interval_secs: default_reaper_interval_secs(),
            retired_id_capacity: default_retired_id_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
        }
    }
}

/// Tokio runtime settings for the replay binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads; `None` uses one per core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_threads: Option<usize>,
}

fn default_start_tag() -> String {
    DEFAULT_START_TAG.to_string()
}
#[allow(clippy::unnecessary_wraps)]
fn default_idle_timeout_wire() -> Option<u64> {
    Some(300)
}
fn default_reaper_interval_secs() -> u64 {
    30
}
fn default_shard_count() -> usize {
    crate::stream::demux::DEFAULT_SHARD_COUNT
}
fn default_retired_id_capacity() -> usize {
    crate::stream::demux::DEFAULT_RETIRED_ID_CAPACITY
}
fn default_log_level() -> String {
    "INFO".to_string()
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError`] when the YAML is malformed or validation fails.
pub fn parse_config(contents: &str) -> Result<InterpreterConfig, ConfigError> {
    // serde_yaml maps an empty document to unit, not to an all-default struct.
    if contents.trim().is_empty() {
        return Ok(InterpreterConfig::default());
    }
    let config: InterpreterConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from a YAML file.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read, parsed, or validated.
pub fn load_config(path: &str) -> Result<InterpreterConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}
