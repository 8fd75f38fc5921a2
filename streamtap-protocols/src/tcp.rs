//! ## streamtap-protocols::tcp
//! **Passive TCP reordering**
//!
//! Rebuilds one direction of a TCP connection from observed segments. A SYN
//! anchors the stream at ISN+1. Without one, data segments are held for a
//! short anchor window (a segment count or a time span, whichever ends
//! first) and the stream is anchored on the lowest sequence number seen in
//! it. Only the contiguous prefix is released, one chunk per segment.
//!
//! Stream positions are tracked as 64-bit offsets from the anchor. Incoming
//! sequence numbers are placed by their signed distance from the next
//! expected sequence, so wraparound needs no special casing.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use etherparse::TcpHeaderSlice;
use tracing::{debug, warn};

pub const DEFAULT_MAX_BUFFERED_SEGMENTS: usize = 1000;
pub const DEFAULT_ANCHOR_SEGMENTS: usize = 16;
pub const DEFAULT_ANCHOR_WINDOW_MS: i64 = 100;

/// How far before an inferred anchor a SYN may point and still be taken as
/// a late copy of the same handshake.
const LATE_SYN_SLACK: i64 = 1 << 24;

/// Contiguous stream bytes from one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub epoch: i64,
    pub data: Bytes,
}

/// Bounds on what a reassembler keeps in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpLimits {
    /// Segments that may wait behind a gap before it is declared lost.
    pub max_buffered_segments: usize,
    /// Data segments held without a SYN before the stream is anchored.
    pub anchor_segments: usize,
    /// Time span (ms, capture clock) after the first held segment before
    /// the stream is anchored without a SYN. Zero anchors on arrival.
    pub anchor_window_ms: i64,
}

impl Default for TcpLimits {
    fn default() -> Self {
        Self {
            max_buffered_segments: DEFAULT_MAX_BUFFERED_SEGMENTS,
            anchor_segments: DEFAULT_ANCHOR_SEGMENTS,
            anchor_window_ms: DEFAULT_ANCHOR_WINDOW_MS,
        }
    }
}

#[derive(Debug)]
struct Segment {
    epoch: i64,
    data: Bytes,
}

#[derive(Debug)]
struct HeldSegment {
    seq: u32,
    epoch: i64,
    data: Bytes,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    /// Sequence number of stream offset 0.
    base: u32,
    /// Stream offset of the next byte to release.
    next: u64,
    from_syn: bool,
}

impl Anchor {
    fn expected_seq(&self) -> u32 {
        self.base.wrapping_add(self.next as u32)
    }

    /// Stream offset of `seq`. Negative means before the released prefix.
    fn offset_of(&self, seq: u32) -> i64 {
        let delta = seq.wrapping_sub(self.expected_seq()) as i32;
        self.next as i64 + i64::from(delta)
    }
}

pub struct TcpReassembler {
    source_port: u16,
    destination_port: u16,
    anchor: Option<Anchor>,
    held: Vec<HeldSegment>,
    held_since: Option<i64>,
    buffered: BTreeMap<u64, Segment>,
    ready: VecDeque<StreamChunk>,
    limits: TcpLimits,
    resyncs: u64,
}

impl TcpReassembler {
    pub fn new(source_port: u16, destination_port: u16) -> Self {
        Self::with_limits(source_port, destination_port, TcpLimits::default())
    }

    pub fn with_limits(source_port: u16, destination_port: u16, limits: TcpLimits) -> Self {
        let max_buffered_segments = limits.max_buffered_segments.max(1);
        Self {
            source_port,
            destination_port,
            anchor: None,
            held: Vec::new(),
            held_since: None,
            buffered: BTreeMap::new(),
            ready: VecDeque::new(),
            limits: TcpLimits {
                max_buffered_segments,
                anchor_segments: limits.anchor_segments.clamp(1, max_buffered_segments),
                anchor_window_ms: limits.anchor_window_ms.max(0),
            },
            resyncs: 0,
        }
    }

    /// Feeds one IP payload (TCP header plus data).
    pub fn ingest(&mut self, segment: &[u8], epoch: i64) {
        let header = match TcpHeaderSlice::from_slice(segment) {
            Ok(header) => header,
            Err(e) => {
                debug!(error = %e, "Skipping unparsable TCP header");
                return;
            }
        };
        if header.source_port() != self.source_port
            || header.destination_port() != self.destination_port
        {
            return;
        }

        let mut seq = header.sequence_number();
        if header.syn() {
            seq = seq.wrapping_add(1);
            self.on_syn(seq);
        }

        let payload = &segment[header.slice().len()..];
        if payload.is_empty() {
            self.poll(epoch);
            return;
        }
        let data = Bytes::copy_from_slice(payload);

        if self.anchor.is_none() {
            self.held_since.get_or_insert(epoch);
            self.held.push(HeldSegment { seq, epoch, data });
            if self.held.len() >= self.limits.anchor_segments {
                self.settle();
            } else {
                self.poll(epoch);
            }
            return;
        }

        self.place(seq, epoch, data);
        self.drain();
        if self.buffered.len() > self.limits.max_buffered_segments {
            self.resync();
        }
    }

    /// Anchors a SYN-less stream once its anchor window has elapsed at `now`.
    pub fn poll(&mut self, now: i64) {
        let expired = self
            .held_since
            .is_some_and(|since| now.saturating_sub(since) >= self.limits.anchor_window_ms);
        if self.anchor.is_none() && expired {
            self.settle();
        }
    }

    /// Anchors a SYN-less stream on the lowest sequence number held so far
    /// and releases whatever is contiguous from there.
    pub fn settle(&mut self) {
        if self.anchor.is_some() {
            return;
        }
        let Some(first) = self.held.first().map(|held| held.seq) else {
            return;
        };
        let base = self
            .held
            .iter()
            .map(|held| held.seq)
            .min_by_key(|seq| seq.wrapping_sub(first) as i32)
            .unwrap_or(first);
        debug!(base, held = self.held.len(), "Anchoring TCP stream without SYN");
        self.anchor = Some(Anchor {
            base,
            next: 0,
            from_syn: false,
        });
        self.release_held();
    }

    pub fn next_datagram(&mut self) -> Option<StreamChunk> {
        self.ready.pop_front()
    }

    /// Segments waiting behind a gap or for an anchor.
    pub fn buffered_segments(&self) -> usize {
        self.buffered.len() + self.held.len()
    }

    pub fn is_anchored(&self) -> bool {
        self.anchor.is_some()
    }

    /// Times a gap was declared lost.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    fn on_syn(&mut self, base: u32) {
        let Some(anchor) = self.anchor else {
            self.anchor = Some(Anchor {
                base,
                next: 0,
                from_syn: true,
            });
            self.release_held();
            return;
        };
        if anchor.base == base {
            return;
        }
        let offset = anchor.offset_of(base);
        if !anchor.from_syn && (-LATE_SYN_SLACK..=anchor.next as i64).contains(&offset) {
            debug!(offset, "Late SYN for an already anchored stream; ignoring");
            return;
        }
        if !self.buffered.is_empty() {
            debug!(dropped = self.buffered.len(), "New SYN; dropping buffered segments");
        }
        self.buffered.clear();
        self.anchor = Some(Anchor {
            base,
            next: 0,
            from_syn: true,
        });
    }

    fn release_held(&mut self) {
        self.held_since = None;
        for held in std::mem::take(&mut self.held) {
            self.place(held.seq, held.epoch, held.data);
        }
        self.drain();
        if self.buffered.len() > self.limits.max_buffered_segments {
            self.resync();
        }
    }

    fn place(&mut self, seq: u32, epoch: i64, data: Bytes) {
        let Some(anchor) = self.anchor else {
            return;
        };
        let start = anchor.offset_of(seq);
        let end = start + data.len() as i64;
        if end <= anchor.next as i64 {
            return;
        }

        let skip = (anchor.next as i64 - start).max(0) as usize;
        let start = start.max(anchor.next as i64) as u64;
        let data = data.slice(skip..);

        let keep_existing = self
            .buffered
            .get(&start)
            .is_some_and(|existing| existing.data.len() >= data.len());
        if !keep_existing {
            self.buffered.insert(start, Segment { epoch, data });
        }
    }

    fn drain(&mut self) {
        let Some(anchor) = self.anchor.as_mut() else {
            return;
        };
        while let Some(entry) = self.buffered.first_entry() {
            let start = *entry.key();
            if start > anchor.next {
                break;
            }
            let segment = entry.remove();
            let skip = (anchor.next - start) as usize;
            if skip >= segment.data.len() {
                continue;
            }
            anchor.next = start + segment.data.len() as u64;
            self.ready.push_back(StreamChunk {
                epoch: segment.epoch,
                data: segment.data.slice(skip..),
            });
        }
    }

    fn resync(&mut self) {
        let (Some(anchor), Some((&lowest, _))) = (self.anchor.as_mut(), self.buffered.first_key_value())
        else {
            return;
        };
        warn!(
            lost_bytes = lowest - anchor.next,
            buffered = self.buffered.len(),
            "TCP gap never filled; skipping ahead"
        );
        anchor.next = lowest;
        self.resyncs += 1;
        self.drain();
    }
}
