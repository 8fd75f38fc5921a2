//! ## streamtap-engine::pipeline
//! **Per-direction reassembly and decoding**
//!
//! Each tracked connection owns two pipelines, one per direction. A captured
//! frame is offered to both; the IP filter keeps only datagrams travelling in
//! the pipeline's own direction.

use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Arc;

use bytes::Bytes;
use streamtap_core::events::Direction;
use streamtap_protocols::{
    BundleDecoder, DecoderStats, Decompressor, FrameFormat, IpDefragmenter, StreamChunk,
    TcpLimits, TcpReassembler,
};

/// Supplies a fresh decompressor for each new pipeline.
pub type DecompressorFactory = Arc<dyn Fn() -> Option<Box<dyn Decompressor>> + Send + Sync>;

/// What one pipeline produced from a frame or a poll.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    /// Reassembled stream bytes, before framing.
    pub stream: Vec<StreamChunk>,
    /// Decoded messages as (capture epoch, payload).
    pub messages: Vec<(i64, Bytes)>,
}

impl PipelineOutput {
    pub fn is_empty(&self) -> bool {
        self.stream.is_empty() && self.messages.is_empty()
    }
}

/// Builds pipelines that share one frame format and codec source.
#[derive(Clone)]
pub struct PipelineFactory {
    format: Arc<dyn FrameFormat>,
    decompressors: DecompressorFactory,
    limits: TcpLimits,
}

impl PipelineFactory {
    pub fn new(
        format: Arc<dyn FrameFormat>,
        decompressors: DecompressorFactory,
        limits: TcpLimits,
    ) -> Self {
        Self {
            format,
            decompressors,
            limits,
        }
    }

    /// Pipelines that never decompress; compressed frames are dropped.
    pub fn without_codec(format: Arc<dyn FrameFormat>, limits: TcpLimits) -> Self {
        Self::new(format, Arc::new(|| None), limits)
    }

    pub fn build(
        &self,
        direction: Direction,
        source: SocketAddrV4,
        destination: SocketAddrV4,
    ) -> DirectionPipeline {
        DirectionPipeline {
            direction,
            ip: IpDefragmenter::tcp(*source.ip(), *destination.ip()),
            tcp: TcpReassembler::with_limits(source.port(), destination.port(), self.limits),
            decoder: BundleDecoder::new(Arc::clone(&self.format), (self.decompressors)()),
        }
    }
}

impl fmt::Debug for PipelineFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineFactory")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

pub struct DirectionPipeline {
    direction: Direction,
    ip: IpDefragmenter,
    tcp: TcpReassembler,
    decoder: BundleDecoder,
}

impl DirectionPipeline {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Runs one captured frame through all three stages. Stream bytes
    /// released by the TCP stage and every completed message are appended
    /// to `out`.
    pub fn feed(&mut self, frame: &[u8], epoch: i64, out: &mut PipelineOutput) {
        self.ip.ingest(frame, epoch);
        while let Some(payload) = self.ip.next_payload() {
            self.tcp.ingest(&payload.data, payload.epoch);
            self.decode_ready(out);
        }
        self.collect_messages(out);
    }

    /// Lets a stream that never saw a SYN anchor once its window has passed
    /// at `now`, decoding whatever that releases.
    pub fn poll(&mut self, now: i64, out: &mut PipelineOutput) {
        self.tcp.poll(now);
        self.decode_ready(out);
        self.collect_messages(out);
    }

    fn decode_ready(&mut self, out: &mut PipelineOutput) {
        while let Some(chunk) = self.tcp.next_datagram() {
            out.stream.push(chunk.clone());
            self.decoder.ingest(chunk);
        }
    }

    fn collect_messages(&mut self, out: &mut PipelineOutput) {
        while let Some(message) = self.decoder.next_message() {
            out.messages.push(message);
        }
    }

    pub fn decoder_stats(&self) -> DecoderStats {
        self.decoder.stats()
    }
}

impl fmt::Debug for DirectionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectionPipeline")
            .field("direction", &self.direction)
            .field("buffered_segments", &self.tcp.buffered_segments())
            .field("buffered_bytes", &self.decoder.buffered_len())
            .finish()
    }
}
