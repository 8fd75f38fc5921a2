//! ## streamtap-telemetry::logging
//! **Process-wide `tracing` subscriber**
//!
//! `RUST_LOG` wins over the configured level. Thread names are included so
//! lines from `streamtap-monitor` and the capture receive threads can be told
//! apart.

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone, Copy, Debug)]
pub struct EventLogger;

impl EventLogger {
    /// Installs the global subscriber. Returns `false` if one was already set.
    pub fn init(default_level: &str) -> bool {
        fmt()
            .with_env_filter(Self::filter(default_level))
            .with_thread_names(true)
            .with_target(true)
            .try_init()
            .is_ok()
    }

    fn filter(default_level: &str) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    }

    /// One structured line per decoded message.
    pub fn log_message(connection: &str, direction: &str, epoch: i64, len: usize) {
        info!(connection, direction, epoch, len, "Message decoded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn message_lines_carry_fields() {
        EventLogger::log_message("10.0.0.2:50000=>10.0.0.9:7000", "received", 1700000000000, 42);
        assert!(logs_contain("Message decoded"));
        assert!(logs_contain("len=42"));
    }

    #[test]
    fn default_level_used_without_env() {
        let filter = EventLogger::filter("debug");
        assert!(!filter.to_string().is_empty());
    }
}
