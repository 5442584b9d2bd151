//! Engine configuration - fixed for the lifetime of a graph.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Render engine and hardware bridge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Samples per second.
    /// Default: 48000
    #[serde(default = "EngineConfig::default_sample_rate")]
    pub sample_rate: u32,

    /// Samples per tick.
    /// Default: 512
    #[serde(default = "EngineConfig::default_buffer_size")]
    pub buffer_size: usize,

    /// Capacity of playback queues, in whole buffers.
    /// Default: 2
    #[serde(default = "EngineConfig::default_playback_queue_buffers")]
    pub playback_queue_buffers: usize,

    /// Deadline for joining background threads during teardown.
    /// Default: 2000
    #[serde(default = "EngineConfig::default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,

    /// How long a capture node waits for hardware before failing the tick.
    /// Default: unset (wait indefinitely). 0 also waits indefinitely, which
    /// lets a later config file clear a timeout set by an earlier one.
    #[serde(default)]
    pub capture_timeout_ms: Option<u64>,

    /// Fixed delay between reconnect attempts of network event sources.
    /// Default: 5000
    #[serde(default = "EngineConfig::default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Time constant for smoothing background sensor targets.
    /// Default: 50
    #[serde(default = "EngineConfig::default_smoothing_time_constant_ms")]
    pub smoothing_time_constant_ms: u64,
}

impl EngineConfig {
    fn default_sample_rate() -> u32 {
        48000
    }

    fn default_buffer_size() -> usize {
        512
    }

    fn default_playback_queue_buffers() -> usize {
        2
    }

    fn default_teardown_timeout_ms() -> u64 {
        2000
    }

    fn default_reconnect_backoff_ms() -> u64 {
        5000
    }

    fn default_smoothing_time_constant_ms() -> u64 {
        50
    }

    /// Wall-clock length of one tick.
    pub fn buffer_period(&self) -> Duration {
        Duration::from_secs_f64(self.buffer_size as f64 / self.sample_rate as f64)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn capture_timeout(&self) -> Option<Duration> {
        self.capture_timeout_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn smoothing_time_constant(&self) -> Duration {
        Duration::from_millis(self.smoothing_time_constant_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: Self::default_sample_rate(),
            buffer_size: Self::default_buffer_size(),
            playback_queue_buffers: Self::default_playback_queue_buffers(),
            teardown_timeout_ms: Self::default_teardown_timeout_ms(),
            capture_timeout_ms: None,
            reconnect_backoff_ms: Self::default_reconnect_backoff_ms(),
            smoothing_time_constant_ms: Self::default_smoothing_time_constant_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or filter directive (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_period() {
        let config = EngineConfig {
            sample_rate: 48000,
            buffer_size: 480,
            ..EngineConfig::default()
        };
        assert!((config.buffer_period().as_secs_f64() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config: EngineConfig = toml::from_str("buffer_size = 128").unwrap();
        assert_eq!(config.buffer_size, 128);
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.capture_timeout(), None);
    }
}
