//! ## streamtap-protocols::bundle
//! **Bundle framing decoder**
//!
//! A bundle is a self-delimited frame: a fixed-size header (magic, total
//! length, message count, compression flag, decompressed length) followed by
//! a body holding one or more length-prefixed messages, optionally
//! compressed.
//!
//! The header schema is pluggable through [`FrameFormat`]; [`BundleFormat`]
//! implements it from a configurable [`BundleLayout`].
//!
//! ### Recovery
//! - Partial frames stall until more bytes arrive.
//! - An invalid header drops bytes up to the next magic and counts one
//!   dropped frame.
//! - A body that fails to decompress or split is dropped; decoding carries on
//!   at the next header.

use std::collections::VecDeque;
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::decompress::Decompressor;
use crate::error::ProtocolError;
use crate::tcp::StreamChunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub header_len: usize,
    /// Header plus body, as carried on the wire.
    pub total_len: usize,
    pub message_count: u16,
    pub compressed: bool,
    pub decompressed_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderParse {
    /// Not enough bytes to decide.
    Incomplete,
    Invalid,
    Frame(FrameHeader),
}

/// Header schema of a framed stream.
pub trait FrameFormat: Send + Sync {
    fn header_len(&self) -> usize;

    /// Parses the header at the start of `buf`.
    fn parse_header(&self, buf: &[u8]) -> HeaderParse;

    /// Offset of the next plausible header start after position 0, if any.
    fn find_resync(&self, buf: &[u8]) -> Option<usize>;

    /// Splits a (decompressed) body into messages.
    fn split_messages(&self, body: &Bytes, header: &FrameHeader) -> Result<Vec<Bytes>, ProtocolError>;
}

/// Byte layout of a bundle header. All multi-byte fields are little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    /// Accepted magic values found at offset 0.
    pub magics: Vec<Vec<u8>>,
    pub header_len: usize,
    /// u32
    pub total_len_offset: usize,
    /// u16
    pub message_count_offset: usize,
    /// u8, nonzero means compressed
    pub compression_offset: usize,
    /// u32
    pub decompressed_len_offset: usize,
    /// Messages start with a u32 length that includes the prefix itself.
    pub length_prefixed: bool,
    pub max_frame_len: usize,
}

pub const DEFAULT_MAGIC: [u8; 16] = [
    0x52, 0x52, 0xa0, 0x41, 0xff, 0x5d, 0x46, 0xe2, 0x7f, 0x2a, 0x64, 0x4d, 0x7b, 0x99, 0xc4, 0x75,
];

impl Default for BundleLayout {
    fn default() -> Self {
        Self {
            magics: vec![DEFAULT_MAGIC.to_vec(), vec![0u8; 16]],
            header_len: 40,
            total_len_offset: 24,
            message_count_offset: 30,
            compression_offset: 33,
            decompressed_len_offset: 36,
            length_prefixed: true,
            max_frame_len: 1 << 20,
        }
    }
}

pub struct BundleFormat {
    layout: BundleLayout,
    magic_len: usize,
    magic_finder: AhoCorasick,
}

impl BundleFormat {
    pub fn new(layout: BundleLayout) -> Result<Self, ProtocolError> {
        let magic_len = layout
            .magics
            .first()
            .map(Vec::len)
            .ok_or(ProtocolError::InvalidLayout("at least one magic is required"))?;
        if magic_len == 0 || layout.magics.iter().any(|m| m.len() != magic_len) {
            return Err(ProtocolError::InvalidLayout("magics must be non-empty and equally long"));
        }
        let fits = |offset: usize, width: usize| offset + width <= layout.header_len;
        if !fits(0, magic_len)
            || !fits(layout.total_len_offset, 4)
            || !fits(layout.message_count_offset, 2)
            || !fits(layout.compression_offset, 1)
            || !fits(layout.decompressed_len_offset, 4)
        {
            return Err(ProtocolError::InvalidLayout("field lies outside the header"));
        }
        if layout.max_frame_len < layout.header_len {
            return Err(ProtocolError::InvalidLayout("max_frame_len is smaller than the header"));
        }

        let magic_finder = AhoCorasick::new(&layout.magics)
            .map_err(|_| ProtocolError::InvalidLayout("magics cannot be searched"))?;

        Ok(Self {
            layout,
            magic_len,
            magic_finder,
        })
    }

    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    fn has_magic(&self, buf: &[u8]) -> bool {
        self.layout.magics.iter().any(|magic| buf.starts_with(magic))
    }
}

#[inline]
fn le_u32(buf: &[u8], offset: usize) -> usize {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]) as usize
}

#[inline]
fn le_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

impl FrameFormat for BundleFormat {
    fn header_len(&self) -> usize {
        self.layout.header_len
    }

    fn parse_header(&self, buf: &[u8]) -> HeaderParse {
        if buf.len() < self.magic_len {
            return HeaderParse::Incomplete;
        }
        if !self.has_magic(buf) {
            return HeaderParse::Invalid;
        }
        if buf.len() < self.layout.header_len {
            return HeaderParse::Incomplete;
        }

        let total_len = le_u32(buf, self.layout.total_len_offset);
        let decompressed_len = le_u32(buf, self.layout.decompressed_len_offset);
        if total_len < self.layout.header_len
            || total_len > self.layout.max_frame_len
            || decompressed_len > self.layout.max_frame_len
        {
            return HeaderParse::Invalid;
        }

        HeaderParse::Frame(FrameHeader {
            header_len: self.layout.header_len,
            total_len,
            message_count: le_u16(buf, self.layout.message_count_offset),
            compressed: buf[self.layout.compression_offset] != 0,
            decompressed_len,
        })
    }

    fn find_resync(&self, buf: &[u8]) -> Option<usize> {
        let rest = buf.get(1..)?;
        self.magic_finder.find(rest).map(|m| m.start() + 1)
    }

    fn split_messages(&self, body: &Bytes, header: &FrameHeader) -> Result<Vec<Bytes>, ProtocolError> {
        if !self.layout.length_prefixed {
            return Ok(vec![body.clone()]);
        }

        let mut messages = Vec::with_capacity(usize::from(header.message_count));
        let mut pos = 0usize;
        while pos < body.len() {
            if header.message_count != 0 && messages.len() == usize::from(header.message_count) {
                break;
            }
            let remaining = body.len() - pos;
            if remaining < 4 {
                return Err(ProtocolError::MessageOverrun { len: 4, remaining });
            }
            let len = le_u32(body, pos);
            if len < 4 || len > remaining {
                return Err(ProtocolError::MessageOverrun { len, remaining });
            }
            messages.push(body.slice(pos..pos + len));
            pos += len;
        }
        Ok(messages)
    }
}

/// Frame counters of one decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub bytes_discarded: u64,
}

pub struct BundleDecoder {
    format: Arc<dyn FrameFormat>,
    decompressor: Option<Box<dyn Decompressor>>,
    buffer: BytesMut,
    /// Stream offset of `buffer[0]`.
    consumed: u64,
    /// (stream offset, epoch) of each chunk still (partly) buffered.
    chunk_epochs: VecDeque<(u64, i64)>,
    resyncing: bool,
    ready: VecDeque<(i64, Bytes)>,
    stats: DecoderStats,
}

impl BundleDecoder {
    pub fn new(format: Arc<dyn FrameFormat>, decompressor: Option<Box<dyn Decompressor>>) -> Self {
        Self {
            format,
            decompressor,
            buffer: BytesMut::new(),
            consumed: 0,
            chunk_epochs: VecDeque::new(),
            resyncing: false,
            ready: VecDeque::new(),
            stats: DecoderStats::default(),
        }
    }

    pub fn ingest(&mut self, chunk: StreamChunk) {
        if chunk.data.is_empty() {
            return;
        }
        self.chunk_epochs
            .push_back((self.consumed + self.buffer.len() as u64, chunk.epoch));
        self.buffer.extend_from_slice(&chunk.data);
        self.decode();
    }

    pub fn next_message(&mut self) -> Option<(i64, Bytes)> {
        self.ready.pop_front()
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Bytes waiting for the rest of a frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn decode(&mut self) {
        loop {
            match self.format.parse_header(&self.buffer) {
                HeaderParse::Incomplete => break,
                HeaderParse::Invalid => self.skip_invalid(),
                HeaderParse::Frame(header) => {
                    if self.buffer.len() < header.total_len {
                        break;
                    }
                    self.resyncing = false;
                    let epoch = self.epoch_at(self.consumed);
                    let frame = self.buffer.split_to(header.total_len).freeze();
                    self.advance(header.total_len);
                    self.emit_frame(epoch, frame, &header);
                }
            }
        }
    }

    fn skip_invalid(&mut self) {
        if !self.resyncing {
            self.resyncing = true;
            self.stats.frames_dropped += 1;
            debug!(consumed = self.consumed, "Invalid frame header; resynchronising");
        }
        let skip = match self.format.find_resync(&self.buffer) {
            Some(offset) => offset,
            None => self
                .buffer
                .len()
                .saturating_sub(self.format.header_len().saturating_sub(1))
                .max(1),
        };
        let _ = self.buffer.split_to(skip);
        self.stats.bytes_discarded += skip as u64;
        self.advance(skip);
    }

    fn emit_frame(&mut self, epoch: i64, frame: Bytes, header: &FrameHeader) {
        let body = frame.slice(header.header_len..);
        let body = if header.compressed {
            match self.decompress(&body, header) {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, "Dropping compressed frame");
                    self.stats.frames_dropped += 1;
                    return;
                }
            }
        } else {
            body
        };

        match self.format.split_messages(&body, header) {
            Ok(messages) => {
                self.stats.frames_decoded += 1;
                self.ready
                    .extend(messages.into_iter().map(|message| (epoch, message)));
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame body");
                self.stats.frames_dropped += 1;
            }
        }
    }

    fn decompress(&mut self, body: &Bytes, header: &FrameHeader) -> Result<Bytes, ProtocolError> {
        let decompressor = self
            .decompressor
            .as_mut()
            .ok_or(ProtocolError::NoDecompressor)?;
        let out = decompressor.decompress(body, header.decompressed_len)?;
        if out.len() != header.decompressed_len {
            return Err(ProtocolError::SizeMismatch {
                expected: header.decompressed_len,
                actual: out.len(),
            });
        }
        Ok(Bytes::from(out))
    }

    fn epoch_at(&self, offset: u64) -> i64 {
        self.chunk_epochs
            .iter()
            .take_while(|(start, _)| *start <= offset)
            .last()
            .map_or(0, |(_, epoch)| *epoch)
    }

    fn advance(&mut self, len: usize) {
        self.consumed += len as u64;
        while self.chunk_epochs.len() > 1 && self.chunk_epochs[1].0 <= self.consumed {
            self.chunk_epochs.pop_front();
        }
    }
}
