//! Decompression backend configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::validation;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    #[default]
    None,
    Library,
    Embedded,
    EmbeddedRegion,
}

/// Signature patterns keyed by entry point name.
#[derive(Default, Debug, Serialize, Deserialize, Validate, Clone, PartialEq, Eq)]
pub struct SignaturesConfig {
    #[validate(custom(function = validation::validate_signatures))]
    #[serde(default)]
    pub global: BTreeMap<String, String>,

    #[validate(custom(function = validation::validate_signatures))]
    #[serde(default)]
    pub region: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct CodecConfig {
    #[serde(default)]
    pub kind: CodecKind,

    /// Library file or module image, depending on `kind`.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// File name looked up in the auto-detect search paths.
    #[validate(length(min = 1))]
    #[serde(default = "default_library_name")]
    pub library_name: String,

    /// Overrides the default `<exe dir>/plugins/<library_name>` search path.
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    #[validate(nested)]
    #[serde(default)]
    pub signatures: SignaturesConfig,
}

fn default_library_name() -> String {
    if cfg!(windows) {
        "oo2net_9_win64.dll".into()
    } else {
        "liboo2net.so".into()
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            kind: CodecKind::default(),
            path: None,
            library_name: default_library_name(),
            search_paths: Vec::new(),
            signatures: SignaturesConfig::default(),
        }
    }
}
