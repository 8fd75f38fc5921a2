//! Maps loaded configuration onto the capture, codec and framing types.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use streamtap_capture::{CaptureBackend, CaptureOptions, CompatMode};
use streamtap_codec::{
    default_search_paths, BackendKind, CodecSelector, NativeLoader, SignatureSets,
};
use streamtap_config::{
    CaptureBackendKind, CaptureConfig, CodecConfig, CodecKind, CompatModeKind, FramingConfig,
    MonitorConfig, PoolPolicyKind, ReassemblyConfig, StreamtapConfig, TargetConfig,
};
use streamtap_core::alloc::PoolPolicy;
use streamtap_protocols::{BundleLayout, TcpLimits};

use crate::discovery::Target;
use crate::error::MonitorError;

/// Loop timing and address override of a [`NetworkMonitor`](crate::NetworkMonitor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub idle_poll: Duration,
    pub cycle_sleep: Duration,
    pub stop_timeout: Duration,
    pub local_ip: Option<Ipv4Addr>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default(), None)
    }
}

impl MonitorSettings {
    pub fn from_config(monitor: &MonitorConfig, local_ip: Option<Ipv4Addr>) -> Self {
        Self {
            idle_poll: Duration::from_millis(monitor.idle_poll_ms),
            cycle_sleep: Duration::from_millis(monitor.cycle_sleep_ms),
            stop_timeout: Duration::from_millis(monitor.stop_timeout_ms),
            local_ip,
        }
    }
}

/// `process_id` takes precedence over `window_name`.
pub fn target(config: &TargetConfig) -> Option<Target> {
    config
        .process_id
        .map(Target::ProcessId)
        .or_else(|| config.window_name.clone().map(Target::WindowName))
}

pub fn capture_backend(config: &CaptureConfig) -> CaptureBackend {
    match config.backend {
        CaptureBackendKind::RawSocket => CaptureBackend::RawSocket,
        CaptureBackendKind::Pcap => CaptureBackend::Pcap,
    }
}

pub fn capture_options(config: &CaptureConfig) -> CaptureOptions {
    CaptureOptions {
        pool_buffers: config.pool_buffers,
        buffer_size: config.buffer_size,
        pool_policy: match config.pool_policy {
            PoolPolicyKind::Bounded => PoolPolicy::Bounded,
            PoolPolicyKind::Grow => PoolPolicy::Grow,
        },
        compat: match config.compat {
            CompatModeKind::Auto => CompatMode::Auto,
            CompatModeKind::Forced => CompatMode::Forced,
            CompatModeKind::Disabled => CompatMode::Disabled,
        },
        read_timeout: Duration::from_millis(config.read_timeout_ms),
    }
}

pub fn tcp_limits(config: &ReassemblyConfig) -> TcpLimits {
    TcpLimits {
        max_buffered_segments: config.max_buffered_segments,
        anchor_segments: config.anchor_window_segments,
        anchor_window_ms: i64::try_from(config.anchor_window_ms).unwrap_or(i64::MAX),
    }
}

pub fn bundle_layout(config: &FramingConfig) -> Result<BundleLayout, MonitorError> {
    Ok(BundleLayout {
        magics: config.magic_bytes()?,
        header_len: config.header_len,
        total_len_offset: config.total_len_offset,
        message_count_offset: config.message_count_offset,
        compression_offset: config.compression_offset,
        decompressed_len_offset: config.decompressed_len_offset,
        length_prefixed: config.length_prefixed,
        max_frame_len: config.max_frame_len,
    })
}

fn backend_kind(kind: CodecKind) -> BackendKind {
    match kind {
        CodecKind::None => BackendKind::None,
        CodecKind::Library => BackendKind::Library,
        CodecKind::Embedded => BackendKind::Embedded,
        CodecKind::EmbeddedRegion => BackendKind::EmbeddedRegion,
    }
}

/// Builds a selector and applies the configured backend.
pub fn codec_selector(config: &CodecConfig) -> Result<CodecSelector, MonitorError> {
    let loader = NativeLoader::new(SignatureSets {
        global: config.signatures.global.clone(),
        region: config.signatures.region.clone(),
    });
    let search_paths = if config.search_paths.is_empty() {
        default_search_paths(&config.library_name)
    } else {
        config.search_paths.clone()
    };
    let mut selector = CodecSelector::new(Box::new(loader), search_paths);

    let kind = backend_kind(config.kind);
    let path = match (&config.path, kind) {
        (_, BackendKind::None) => PathBuf::new(),
        (Some(path), _) => path.clone(),
        (None, BackendKind::Library) => PathBuf::from(&config.library_name),
        (None, _) => {
            return Err(MonitorError::Config(
                "codec.path is required for embedded codecs".into(),
            ))
        }
    };
    selector.configure(kind, &path)?;
    Ok(selector)
}

/// Checks everything a monitor needs before it can start.
pub fn ensure_startable(config: &StreamtapConfig) -> Result<Target, MonitorError> {
    target(&config.target)
        .ok_or_else(|| MonitorError::Config("target.process_id or target.window_name is required".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_wins_over_name() {
        let config = TargetConfig {
            process_id: Some(42),
            window_name: Some("game".into()),
            local_ip: None,
        };
        assert_eq!(target(&config), Some(Target::ProcessId(42)));
        assert_eq!(target(&TargetConfig::default()), None);
    }

    #[test]
    fn default_framing_matches_bundle_defaults() {
        assert_eq!(
            bundle_layout(&FramingConfig::default()).unwrap(),
            BundleLayout::default()
        );
    }

    #[test]
    fn capture_settings_carry_over() {
        let config = CaptureConfig {
            backend: CaptureBackendKind::RawSocket,
            pool_policy: PoolPolicyKind::Grow,
            compat: CompatModeKind::Forced,
            ..CaptureConfig::default()
        };
        let options = capture_options(&config);
        assert_eq!(options.pool_policy, PoolPolicy::Grow);
        assert_eq!(options.compat, CompatMode::Forced);
        assert_eq!(options.buffer_size, 65537);
        assert_eq!(capture_backend(&config), CaptureBackend::RawSocket);
    }

    #[test]
    fn reassembly_limits_carry_over() {
        assert_eq!(tcp_limits(&ReassemblyConfig::default()), TcpLimits::default());

        let config = ReassemblyConfig {
            max_buffered_segments: 50,
            anchor_window_segments: 4,
            anchor_window_ms: 0,
        };
        assert_eq!(
            tcp_limits(&config),
            TcpLimits {
                max_buffered_segments: 50,
                anchor_segments: 4,
                anchor_window_ms: 0,
            }
        );
    }

    #[test]
    fn embedded_codec_without_path_is_rejected() {
        let config = CodecConfig {
            kind: CodecKind::Embedded,
            ..CodecConfig::default()
        };
        assert!(matches!(codec_selector(&config), Err(MonitorError::Config(_))));

        let selector = codec_selector(&CodecConfig::default()).unwrap();
        assert_eq!(selector.current_kind(), BackendKind::None);
    }

    #[test]
    fn missing_target_fails_fast() {
        assert!(matches!(
            ensure_startable(&StreamtapConfig::default()),
            Err(MonitorError::Config(_))
        ));
    }
}
