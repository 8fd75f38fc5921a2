use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid frame layout: {0}")]
    InvalidLayout(&'static str),

    #[error("Invalid frame header: {0}")]
    InvalidFrame(&'static str),

    #[error("Frame length {len} exceeds limit {limit}")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("Message length {len} does not fit the remaining {remaining} body bytes")]
    MessageOverrun { len: usize, remaining: usize },

    #[error("Compressed frame received but no decompressor is configured")]
    NoDecompressor,

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Decompressed {actual} bytes, header declared {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}
