//! Decompression seam used by the framing decoder.

use crate::error::ProtocolError;

/// Per-stream decompressor. Implementations may keep history between calls,
/// so one instance must only ever see the frames of a single stream.
pub trait Decompressor: Send {
    /// Decompresses `input`, which the frame header declares to expand to
    /// exactly `decompressed_len` bytes.
    fn decompress(&mut self, input: &[u8], decompressed_len: usize) -> Result<Vec<u8>, ProtocolError>;
}
