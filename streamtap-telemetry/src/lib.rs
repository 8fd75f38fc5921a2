//! # streamtap-telemetry
//!
//! Logging setup and Prometheus counters for the capture pipeline.

pub mod logging;
pub mod metrics;

pub use logging::EventLogger;
pub use metrics::MetricsRecorder;
