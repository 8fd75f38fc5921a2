//! Monitor loop timing and stream reassembly limits.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct MonitorConfig {
    /// Sleep between cycles while the target has no connections.
    #[validate(range(min = 1, max = 60000))]
    #[serde(default = "default_idle_poll")]
    pub idle_poll_ms: u64,

    /// Sleep between capture cycles.
    #[validate(range(max = 1000))]
    #[serde(default = "default_cycle_sleep")]
    pub cycle_sleep_ms: u64,

    /// How long `stop()` waits for the worker before abandoning it.
    #[validate(range(min = 100, max = 60000))]
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
}

fn default_idle_poll() -> u64 {
    1000
}
fn default_cycle_sleep() -> u64 {
    10
}
fn default_stop_timeout() -> u64 {
    5000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: default_idle_poll(),
            cycle_sleep_ms: default_cycle_sleep(),
            stop_timeout_ms: default_stop_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct ReassemblyConfig {
    /// Segments allowed to wait behind a gap before it is skipped.
    #[validate(range(min = 1, max = 100000))]
    #[serde(default = "default_max_buffered_segments")]
    pub max_buffered_segments: usize,

    /// Data segments held before a stream that showed no SYN is anchored
    /// on the lowest sequence number seen.
    #[validate(range(min = 1, max = 100000))]
    #[serde(default = "default_anchor_window_segments")]
    pub anchor_window_segments: usize,

    /// How long (capture clock) a stream without SYN waits for earlier
    /// segments before it is anchored. Zero anchors on the first segment.
    #[validate(range(max = 60000))]
    #[serde(default = "default_anchor_window_ms")]
    pub anchor_window_ms: u64,
}

fn default_max_buffered_segments() -> usize {
    1000
}
fn default_anchor_window_segments() -> usize {
    16
}
fn default_anchor_window_ms() -> u64 {
    100
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_buffered_segments: default_max_buffered_segments(),
            anchor_window_segments: default_anchor_window_segments(),
            anchor_window_ms: default_anchor_window_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_default_monitor_config() {
        MonitorConfig::default()
            .validate()
            .expect("Default config should be valid");
    }

    #[test]
    fn invalid_timing() {
        let mut config = MonitorConfig::default();
        config.stop_timeout_ms = 0;
        assert!(config.validate().is_err());

        let reassembly = ReassemblyConfig {
            max_buffered_segments: 0,
            ..ReassemblyConfig::default()
        };
        assert!(reassembly.validate().is_err());
    }

    #[test]
    fn anchor_window_bounds() {
        ReassemblyConfig::default()
            .validate()
            .expect("Default reassembly config should be valid");

        let eager = ReassemblyConfig {
            anchor_window_ms: 0,
            ..ReassemblyConfig::default()
        };
        assert!(eager.validate().is_ok());

        let no_segments = ReassemblyConfig {
            anchor_window_segments: 0,
            ..ReassemblyConfig::default()
        };
        assert!(no_segments.validate().is_err());

        let too_long = ReassemblyConfig {
            anchor_window_ms: 60_001,
            ..ReassemblyConfig::default()
        };
        assert!(too_long.validate().is_err());
    }
}
