// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration, loaded from an optional JSON file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use veil_core::{EngineError, EngineResult, WritePolicy, MAX_SAMPLE_ROWS};

/// Default cap on the serialized size of a materialized result.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VeilConfig {
    /// Policy applied to requests that do not name one
    #[serde(default)]
    pub write_policy: WritePolicy,
    /// Cap on the serialized size of returned rows (bytes)
    #[serde(default = "default_max_result_bytes")]
    pub max_result_bytes: usize,
    /// Fraction of the cap above which the total row count is queried
    #[serde(default = "default_count_threshold_ratio")]
    pub count_threshold_ratio: f64,
    /// Channel capacity between a driver and the materializer
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    #[serde(default = "default_max_sample_rows")]
    pub max_sample_rows: u32,
    #[serde(default = "default_sample_rows")]
    pub default_sample_rows: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for rolling log files
    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

fn default_max_result_bytes() -> usize {
    DEFAULT_MAX_RESULT_BYTES
}

fn default_count_threshold_ratio() -> f64 {
    0.9
}

fn default_stream_buffer() -> usize {
    256
}

fn default_max_sample_rows() -> u32 {
    MAX_SAMPLE_ROWS
}

fn default_sample_rows() -> u32 {
    10
}

fn default_log_directory() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    let mut path = PathBuf::from(home);
    path.push(".veil");
    path.push("logs");
    path
}

fn default_log_filter() -> String {
    "veil=info".to_string()
}

fn default_retention_days() -> u64 {
    14
}

impl Default for VeilConfig {
    fn default() -> Self {
        Self {
            write_policy: WritePolicy::default(),
            max_result_bytes: default_max_result_bytes(),
            count_threshold_ratio: default_count_threshold_ratio(),
            stream_buffer: default_stream_buffer(),
            max_sample_rows: default_max_sample_rows(),
            default_sample_rows: default_sample_rows(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            filter: default_log_filter(),
            retention_days: default_retention_days(),
        }
    }
}

impl VeilConfig {
    /// Loads configuration from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No config file found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::validation(format!("Failed to read config: {e}")))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| EngineError::validation(format!("Failed to parse config: {e}")))?;
        config.validate()?;

        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::internal(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| EngineError::internal(format!("Failed to write config: {e}")))
    }

    fn validate(&self) -> EngineResult<()> {
        if self.max_result_bytes == 0 {
            return Err(EngineError::validation("max_result_bytes must be positive"));
        }
        if !(0.0..=1.0).contains(&self.count_threshold_ratio) {
            return Err(EngineError::validation(
                "count_threshold_ratio must be between 0 and 1",
            ));
        }
        if self.max_sample_rows == 0 || self.max_sample_rows > MAX_SAMPLE_ROWS {
            return Err(EngineError::validation(format!(
                "max_sample_rows must be between 1 and {MAX_SAMPLE_ROWS}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = VeilConfig::load(dir.path().join("veil.json")).unwrap();
        assert_eq!(config, VeilConfig::default());
        assert_eq!(config.max_result_bytes, 2 * 1024 * 1024);
        assert_eq!(config.write_policy, WritePolicy::Confirm);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veil.json");
        std::fs::write(
            &path,
            r#"{"write_policy": "read-only", "logging": {"filter": "veil=debug"}}"#,
        )
        .unwrap();

        let config = VeilConfig::load(&path).unwrap();
        assert_eq!(config.write_policy, WritePolicy::ReadOnly);
        assert_eq!(config.logging.filter, "veil=debug");
        assert_eq!(config.logging.retention_days, 14);
        assert_eq!(config.stream_buffer, 256);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veil.json");
        let config = VeilConfig {
            write_policy: WritePolicy::SkipConfirmation,
            max_result_bytes: 4096,
            ..VeilConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(VeilConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veil.json");
        std::fs::write(&path, r#"{"count_threshold_ratio": 1.5}"#).unwrap();
        assert!(matches!(
            VeilConfig::load(&path),
            Err(EngineError::ValidationError { .. })
        ));
    }
}
