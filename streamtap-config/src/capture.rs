//! Packet capture configuration.
//!
//! Backend choice, buffer pool sizing and the raw-socket compatibility
//! switch.

use serde::{Deserialize, Deserializer, Serialize};
use validator::{self, Validate};

/// Raw sockets on Linux are only handed inbound datagrams, so pcap is the
/// default there.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaptureBackendKind {
    RawSocket,
    Pcap,
}

impl Default for CaptureBackendKind {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            CaptureBackendKind::Pcap
        } else {
            CaptureBackendKind::RawSocket
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolPolicyKind {
    #[default]
    Bounded,
    Grow,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompatModeKind {
    #[default]
    Auto,
    Forced,
    Disabled,
}

/// Packet capture configuration.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct CaptureConfig {
    #[serde(default)]
    pub backend: CaptureBackendKind,

    /// Buffers pre-allocated in the capture pool.
    #[validate(range(min = 1, max = 4096))]
    #[serde(default = "default_pool_buffers")]
    pub pool_buffers: usize,

    /// Size of one capture buffer in bytes.
    #[validate(range(min = 1500, max = 16777216))]
    #[serde(default = "default_buffer_size", deserialize_with = "deserialize_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub pool_policy: PoolPolicyKind,

    #[serde(default)]
    pub compat: CompatModeKind,

    /// Upper bound on a single blocking receive (milliseconds).
    #[validate(range(min = 1, max = 5000))]
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

fn default_pool_buffers() -> usize {
    20
}

fn default_buffer_size() -> usize {
    64 * 1024 + 1
}

fn default_read_timeout() -> u64 {
    100
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Num(usize),
    Str(String),
}

/// Accepts plain byte counts or human-friendly sizes such as "64KiB".
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    match SizeValue::deserialize(deserializer)? {
        SizeValue::Num(n) => Ok(n),
        SizeValue::Str(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: f64 = number.parse().map_err(|e| format!("{e}"))?;
    let multiplier = match unit.trim().to_lowercase().as_str() {
        "" | "b" => 1.0,
        "kb" | "kib" => 1024.0,
        "mb" | "mib" => 1024.0 * 1024.0,
        other => return Err(format!("Unknown size unit {other:?}")),
    };
    Ok((number * multiplier) as usize)
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackendKind::default(),
            pool_buffers: default_pool_buffers(),
            buffer_size: default_buffer_size(),
            pool_policy: PoolPolicyKind::default(),
            compat: CompatModeKind::default(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}
