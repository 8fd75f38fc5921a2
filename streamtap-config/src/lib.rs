//! # streamtap-config
//!
//! Layered configuration for the capture pipeline.
//!
//! Sources are merged in order, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. `config/streamtap.yaml`
//! 3. `config/<STREAMTAP_ENV>.yaml` (default environment: `production`)
//! 4. `STREAMTAP_*` environment variables, nested with `__`
//!    (e.g. `STREAMTAP_CAPTURE__BACKEND=pcap`)

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod capture;
mod codec;
mod error;
mod framing;
mod monitor;
mod target;
mod telemetry;
mod validation;

pub use capture::{CaptureBackendKind, CaptureConfig, CompatModeKind, PoolPolicyKind};
pub use codec::{CodecConfig, CodecKind, SignaturesConfig};
pub use error::ConfigError;
pub use framing::FramingConfig;
pub use monitor::{MonitorConfig, ReassemblyConfig};
pub use target::TargetConfig;
pub use telemetry::TelemetryConfig;

const BASE_FILE: &str = "config/streamtap.yaml";
const ENV_PREFIX: &str = "STREAMTAP_";

/// Top-level configuration container.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone)]
pub struct StreamtapConfig {
    #[validate(nested)]
    #[serde(default)]
    pub target: TargetConfig,

    #[validate(nested)]
    #[serde(default)]
    pub capture: CaptureConfig,

    #[validate(nested)]
    #[serde(default)]
    pub codec: CodecConfig,

    #[validate(nested)]
    #[serde(default)]
    pub framing: FramingConfig,

    #[validate(nested)]
    #[serde(default)]
    pub reassembly: ReassemblyConfig,

    #[validate(nested)]
    #[serde(default)]
    pub monitor: MonitorConfig,

    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl StreamtapConfig {
    /// Loads the layered configuration from the working directory.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(StreamtapConfig::default()));

        if Path::new(BASE_FILE).exists() {
            figment = figment.merge(Yaml::file(BASE_FILE));
        }

        let env = std::env::var("STREAMTAP_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{env}.yaml");
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::finish(figment)
    }

    /// Loads defaults overlaid with a single explicit file and the environment.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let figment =
            Figment::from(Serialized::defaults(StreamtapConfig::default())).merge(Yaml::file(path));
        Self::finish(figment)
    }

    fn finish(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["ENV"]).split("__"))
            .extract()?;
        config.validate()?;
        config.framing.check_layout()?;
        Ok(config)
    }
}
