//! Configuration loading and validation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Compaction settings as written in a config file. Absent fields fall back
/// to the legacy flat fields on [`DbConfig`], then to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_threshold: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_file_threshold: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_compact_on_startup: Option<bool>,
}

/// Fully resolved compaction configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionConfig {
    pub enabled: bool,
    pub event_threshold: u64,
    pub batch_file_threshold: u64,
    pub auto_compact_on_startup: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            event_threshold: default_event_threshold(),
            batch_file_threshold: default_batch_file_threshold(),
            auto_compact_on_startup: false,
        }
    }
}

fn default_event_threshold() -> u64 {
    10_000
}

fn default_batch_file_threshold() -> u64 {
    10
}

fn default_branch() -> String {
    "events".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_buffered_events() -> usize {
    1_000
}

fn default_max_events_per_segment() -> usize {
    10_000
}

/// Main database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Filesystem root for the blob store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Branch name; the default log lives under `events/`.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Buffered events that force a flush to a new segment.
    #[serde(default = "default_max_buffered_events")]
    pub max_buffered_events: usize,

    /// Maximum events per written segment file.
    #[serde(default = "default_max_events_per_segment")]
    pub max_events_per_segment: usize,

    /// Legacy flat threshold, consulted only when
    /// `compaction.batch_file_threshold` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_compact_file_threshold: Option<u64>,

    /// Legacy flat threshold, consulted only when
    /// `compaction.event_threshold` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_compact_event_threshold: Option<u64>,

    #[serde(default)]
    pub compaction: CompactionSettings,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            branch: default_branch(),
            max_buffered_events: default_max_buffered_events(),
            max_events_per_segment: default_max_events_per_segment(),
            compaction: CompactionSettings::default(),
            auto_compact_file_threshold: None,
            auto_compact_event_threshold: None,
        }
    }
}

impl DbConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: DbConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the effective compaction configuration: the nested object wins,
    /// legacy flat fields fill its gaps, defaults fill the rest.
    pub fn compaction_config(&self) -> CompactionConfig {
        let defaults = CompactionConfig::default();
        CompactionConfig {
            enabled: self.compaction.enabled.unwrap_or(defaults.enabled),
            event_threshold: self
                .compaction
                .event_threshold
                .or(self.auto_compact_event_threshold)
                .unwrap_or(defaults.event_threshold),
            batch_file_threshold: self
                .compaction
                .batch_file_threshold
                .or(self.auto_compact_file_threshold)
                .unwrap_or(defaults.batch_file_threshold),
            auto_compact_on_startup: self
                .compaction
                .auto_compact_on_startup
                .unwrap_or(defaults.auto_compact_on_startup),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.branch.is_empty()
            || !self
                .branch
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(ConfigError::ValidationError(format!(
                "branch must be a non-empty lowercase identifier, got '{}'",
                self.branch
            )));
        }

        if self.max_events_per_segment == 0 {
            return Err(ConfigError::ValidationError(
                "max_events_per_segment must be greater than 0".to_string(),
            ));
        }

        let compaction = self.compaction_config();
        if compaction.event_threshold == 0 || compaction.batch_file_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "compaction thresholds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DbConfig::default();

        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.branch, "events");
        assert_eq!(config.max_events_per_segment, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_compaction_defaults() {
        let config = DbConfig::default().compaction_config();

        assert!(config.enabled);
        assert_eq!(config.event_threshold, 10_000);
        assert_eq!(config.batch_file_threshold, 10);
        assert!(!config.auto_compact_on_startup);
    }

    #[test]
    fn test_legacy_fields_fill_gaps_only() {
        let mut config = DbConfig::default();
        config.auto_compact_event_threshold = Some(42);
        config.auto_compact_file_threshold = Some(7);

        let resolved = config.compaction_config();
        assert_eq!(resolved.event_threshold, 42);
        assert_eq!(resolved.batch_file_threshold, 7);

        // Nested values win over legacy flat fields.
        config.compaction.event_threshold = Some(500);
        let resolved = config.compaction_config();
        assert_eq!(resolved.event_threshold, 500);
        assert_eq!(resolved.batch_file_threshold, 7);
    }

    #[test]
    fn test_validation_rejects_bad_branch() {
        let mut config = DbConfig::default();
        config.branch = "My Branch".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_thresholds() {
        let mut config = DbConfig::default();
        config.compaction.event_threshold = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = DbConfig::default();
        let toml_str = toml::to_string(&config).unwrap();

        let parsed: DbConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.branch, parsed.branch);
        assert_eq!(config.data_dir, parsed.data_dir);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: DbConfig = toml::from_str(
            r#"
            branch = "main"

            [compaction]
            event_threshold = 100
            "#,
        )
        .unwrap();

        assert_eq!(parsed.branch, "main");
        let compaction = parsed.compaction_config();
        assert_eq!(compaction.event_threshold, 100);
        assert_eq!(compaction.batch_file_threshold, 10);
    }
}
