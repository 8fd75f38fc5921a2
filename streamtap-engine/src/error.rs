use std::io;
use std::path::PathBuf;

use streamtap_capture::CaptureError;
use streamtap_codec::CodecError;
use streamtap_config::ConfigError;
use streamtap_protocols::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("No process matches {0}")]
    ProcessNotFound(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed entry in {path}: {line}")]
    Parse { path: PathBuf, line: String },
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Monitor misconfigured: {0}")]
    Config(String),

    #[error("Monitor is already running")]
    AlreadyRunning,

    #[error("Capture socket reported an unrecoverable receive error")]
    CaptureUnhealthy,

    #[error("Failed to spawn monitor thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Settings(#[from] ConfigError),
}
