use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("No codec backend is configured")]
    NoBackend,

    #[error("Failed to load codec module {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("Codec module does not export {0}")]
    MissingExport(&'static str),

    #[error("No signatures configured for embedded codec discovery")]
    NoSignatures,

    #[error("Signature for {0} not found in module")]
    MissingSignature(&'static str),

    #[error("Invalid signature {name}: {reason}")]
    InvalidSignature { name: String, reason: String },

    #[error("Failed to read process mappings: {0}")]
    Maps(#[from] std::io::Error),

    #[error("Codec session setup failed: {0}")]
    Session(String),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}
