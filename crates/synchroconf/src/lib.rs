//! Configuration loading for Synchrotron.
//!
//! Two kinds of configuration live here:
//!
//! - **Engine** (`SynchroConfig`): sample rate, buffer size, bridge sizing,
//!   teardown deadlines and log level. Fixed for the lifetime of a graph.
//!
//! - **Patch** (`PatchConfig`): which nodes exist, their parameters, and how
//!   their ports are wired. Loaded from a separate TOML file per run.
//!
//! # Usage
//!
//! ```rust,no_run
//! use synchroconf::SynchroConfig;
//!
//! let config = SynchroConfig::load().expect("Failed to load config");
//! println!("{} Hz / {} samples", config.engine.sample_rate, config.engine.buffer_size);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/synchrotron/config.toml` (system)
//! 2. `~/.config/synchrotron/config.toml` (user)
//! 3. `./synchrotron.toml` (local override, or a CLI path)
//! 4. Environment variables (`SYNCHROTRON_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [engine]
//! sample_rate = 44100
//! buffer_size = 256
//! playback_queue_buffers = 2
//! teardown_timeout_ms = 2000
//!
//! [telemetry]
//! log_level = "debug"
//! ```

pub mod engine;
pub mod loader;
pub mod patch;

pub use engine::{EngineConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use patch::{ConnectionConfig, NodeConfig, ParamValue, PatchConfig, PortRef};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Complete Synchrotron engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SynchroConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl SynchroConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/synchrotron/config.toml`
    /// 3. `~/.config/synchrotron/config.toml`
    /// 4. `./synchrotron.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./synchrotron.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            loader::merge_tables(&mut merged, loader::load_table(&path)?);
            sources.files.push(path);
        }

        let mut config = loader::from_table(merged)?;
        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.sample_rate == 0 {
            return Err(ConfigError::Invalid {
                field: "engine.sample_rate",
                message: "must be a positive integer".to_string(),
            });
        }
        if self.engine.buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "engine.buffer_size",
                message: "must be a positive integer".to_string(),
            });
        }
        if self.engine.playback_queue_buffers == 0 {
            return Err(ConfigError::Invalid {
                field: "engine.playback_queue_buffers",
                message: "must hold at least one buffer".to_string(),
            });
        }
        Ok(())
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# Synchrotron Configuration\n\n");

        output.push_str("[engine]\n");
        output.push_str(&format!("sample_rate = {}\n", self.engine.sample_rate));
        output.push_str(&format!("buffer_size = {}\n", self.engine.buffer_size));
        output.push_str(&format!(
            "playback_queue_buffers = {}\n",
            self.engine.playback_queue_buffers
        ));
        output.push_str(&format!(
            "teardown_timeout_ms = {}\n",
            self.engine.teardown_timeout_ms
        ));
        if let Some(timeout) = self.engine.capture_timeout_ms {
            output.push_str(&format!("capture_timeout_ms = {}\n", timeout));
        }
        output.push_str(&format!(
            "reconnect_backoff_ms = {}\n",
            self.engine.reconnect_backoff_ms
        ));
        output.push_str(&format!(
            "smoothing_time_constant_ms = {}\n",
            self.engine.smoothing_time_constant_ms
        ));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.telemetry.log_level
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SynchroConfig::default();
        assert_eq!(config.engine.sample_rate, 48000);
        assert_eq!(config.engine.buffer_size, 512);
        assert_eq!(config.telemetry.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_to_toml_roundtrips_through_parser() {
        let mut config = SynchroConfig::default();
        config.engine.buffer_size = 128;
        config.engine.capture_timeout_ms = Some(250);

        let text = config.to_toml();
        assert!(text.contains("[engine]"));
        assert!(text.contains("[telemetry]"));

        let parsed: SynchroConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let mut config = SynchroConfig::default();
        config.engine.buffer_size = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "engine.buffer_size",
                ..
            }
        ));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[engine]\nbuffer_size = 64\n").unwrap();

        let (config, sources) = SynchroConfig::load_with_sources_from(Some(&path)).unwrap();
        assert!(sources.files.contains(&path));
        if !sources.env_overrides.iter().any(|v| v == "SYNCHROTRON_BUFFER_SIZE") {
            assert_eq!(config.engine.buffer_size, 64);
        }
    }
}
