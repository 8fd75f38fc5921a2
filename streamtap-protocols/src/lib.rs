//! # Streamtap Stream Decoders
//!
//! Turns captured IPv4 frames into application messages in three stages:
//! IP filtering and defragmentation (`ip`), TCP reordering (`tcp`) and
//! message framing with optional decompression (`bundle`).

pub mod bundle;
pub mod decompress;
pub mod error;
pub mod ip;
pub mod tcp;

pub use bundle::{
    BundleDecoder, BundleFormat, BundleLayout, DecoderStats, FrameFormat, FrameHeader, HeaderParse,
    DEFAULT_MAGIC,
};
pub use decompress::Decompressor;
pub use error::ProtocolError;
pub use ip::{IpDefragmenter, IpPayload};
pub use tcp::{StreamChunk, TcpLimits, TcpReassembler};
