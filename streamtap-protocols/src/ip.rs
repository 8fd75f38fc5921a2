//! ## streamtap-protocols::ip
//! **IPv4 filter and defragmenter**
//!
//! Keeps the datagrams of one (source, destination, protocol) triple and
//! rebuilds fragmented ones. A single captured frame may carry several
//! concatenated datagrams, and a trailing partial datagram is completed by
//! the next ingest.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::Ipv4Addr;

use bytes::Bytes;
use etherparse::{IpNumber, Ipv4HeaderSlice};
use tracing::debug;

const MIN_HEADER_LEN: usize = 20;
/// Incomplete fragment sets older than this (capture time) are evicted.
pub const FRAGMENT_TIMEOUT_MS: i64 = 30_000;
/// Upper bound on concurrently buffered fragment sets.
pub const MAX_FRAGMENT_SETS: usize = 64;

/// The payload of one complete datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPayload {
    pub epoch: i64,
    pub data: Bytes,
}

#[derive(Debug)]
struct FragmentSet {
    first_epoch: i64,
    last_seen: i64,
    /// Byte offset -> fragment payload
    pieces: BTreeMap<usize, Vec<u8>>,
    total_len: Option<usize>,
}

impl FragmentSet {
    fn new(epoch: i64) -> Self {
        Self {
            first_epoch: epoch,
            last_seen: epoch,
            pieces: BTreeMap::new(),
            total_len: None,
        }
    }

    fn insert(&mut self, offset: usize, data: &[u8], last: bool, epoch: i64) {
        self.first_epoch = self.first_epoch.min(epoch);
        self.last_seen = self.last_seen.max(epoch);
        if last {
            self.total_len = Some(offset + data.len());
        }
        let keep_existing = self
            .pieces
            .get(&offset)
            .is_some_and(|existing| existing.len() >= data.len());
        if !keep_existing {
            self.pieces.insert(offset, data.to_vec());
        }
    }

    /// Reassembled payload once the last fragment is in and nothing is missing.
    fn assemble(&self) -> Option<Vec<u8>> {
        let total = self.total_len?;
        let mut covered = 0usize;
        for (&offset, data) in &self.pieces {
            if offset > covered {
                return None;
            }
            covered = covered.max(offset + data.len());
        }
        if covered < total {
            return None;
        }

        let mut out = Vec::with_capacity(total);
        for (&offset, data) in &self.pieces {
            let end = (offset + data.len()).min(total);
            if end > out.len() {
                out.extend_from_slice(&data[out.len() - offset..end - offset]);
            }
        }
        Some(out)
    }
}

pub struct IpDefragmenter {
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: IpNumber,
    pending: Vec<u8>,
    pending_epoch: i64,
    fragments: HashMap<u16, FragmentSet>,
    ready: VecDeque<IpPayload>,
}

impl IpDefragmenter {
    pub fn new(source: Ipv4Addr, destination: Ipv4Addr, protocol: IpNumber) -> Self {
        Self {
            source,
            destination,
            protocol,
            pending: Vec::new(),
            pending_epoch: 0,
            fragments: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    /// Convenience constructor for TCP traffic.
    pub fn tcp(source: Ipv4Addr, destination: Ipv4Addr) -> Self {
        Self::new(source, destination, IpNumber::TCP)
    }

    pub fn ingest(&mut self, frame: &[u8], epoch: i64) {
        if self.pending.is_empty() {
            self.pending_epoch = epoch;
        }
        self.pending.extend_from_slice(frame);

        let mut offset = 0usize;
        while offset < self.pending.len() {
            let rest = &self.pending[offset..];
            // The first byte alone tells whether a header can start here, so
            // link-layer padding is dropped now instead of poisoning the next
            // frame.
            let version = rest[0] >> 4;
            let header_len = usize::from(rest[0] & 0x0f) * 4;
            if version != 4 || header_len < MIN_HEADER_LEN {
                debug!(version, header_len, "Malformed IPv4 data; discarding buffer");
                self.pending.clear();
                return;
            }
            if rest.len() < MIN_HEADER_LEN {
                break;
            }

            let total_len = usize::from(u16::from_be_bytes([rest[2], rest[3]]));
            if total_len < header_len {
                debug!(header_len, total_len, "Malformed IPv4 data; discarding buffer");
                self.pending.clear();
                return;
            }
            if total_len > rest.len() {
                break;
            }

            let datagram_epoch = if offset == 0 { self.pending_epoch } else { epoch };
            let datagram = self.pending[offset..offset + total_len].to_vec();
            self.process_datagram(&datagram, header_len, datagram_epoch);
            offset += total_len;
        }

        if offset > 0 {
            self.pending.drain(..offset);
            self.pending_epoch = epoch;
        }
    }

    pub fn next_payload(&mut self) -> Option<IpPayload> {
        self.ready.pop_front()
    }

    /// Incomplete fragment sets currently held.
    pub fn fragment_sets(&self) -> usize {
        self.fragments.len()
    }

    /// Bytes of a partial datagram waiting for the next frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn process_datagram(&mut self, datagram: &[u8], header_len: usize, epoch: i64) {
        let header = match Ipv4HeaderSlice::from_slice(datagram) {
            Ok(header) => header,
            Err(e) => {
                debug!(error = %e, "Skipping unparsable IPv4 header");
                return;
            }
        };
        if header.source_addr() != self.source
            || header.destination_addr() != self.destination
            || header.protocol() != self.protocol
        {
            return;
        }

        let payload = &datagram[header_len..];
        let fragment_offset = usize::from(header.fragments_offset().value()) * 8;
        let more_fragments = header.more_fragments();

        if fragment_offset == 0 && !more_fragments {
            self.ready.push_back(IpPayload {
                epoch,
                data: Bytes::copy_from_slice(payload),
            });
            return;
        }

        let id = header.identification();
        if !self.fragments.contains_key(&id) {
            self.evict(epoch);
        }
        let set = self
            .fragments
            .entry(id)
            .or_insert_with(|| FragmentSet::new(epoch));
        set.insert(fragment_offset, payload, !more_fragments, epoch);

        if let Some(data) = set.assemble() {
            let first_epoch = set.first_epoch;
            self.fragments.remove(&id);
            self.ready.push_back(IpPayload {
                epoch: first_epoch,
                data: Bytes::from(data),
            });
        }
    }

    fn evict(&mut self, now: i64) {
        let before = self.fragments.len();
        self.fragments
            .retain(|_, set| now - set.last_seen <= FRAGMENT_TIMEOUT_MS);

        while self.fragments.len() >= MAX_FRAGMENT_SETS {
            let oldest = self
                .fragments
                .iter()
                .min_by_key(|(_, set)| set.first_epoch)
                .map(|(&id, _)| id);
            match oldest {
                Some(id) => {
                    self.fragments.remove(&id);
                }
                None => break,
            }
        }

        let evicted = before - self.fragments.len();
        if evicted > 0 {
            debug!(evicted, "Evicted incomplete IPv4 fragment sets");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    pub(crate) const SERVER: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 20);

    /// Builds one IPv4 datagram. `offset` is in bytes and must be a multiple of 8.
    pub(crate) fn datagram(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        id: u16,
        offset: usize,
        more: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let total = (20 + payload.len()) as u16;
        let mut flags_offset = (offset / 8) as u16;
        if more {
            flags_offset |= 0x2000;
        }
        let mut out = vec![0x45, 0x00];
        out.extend_from_slice(&total.to_be_bytes());
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&flags_offset.to_be_bytes());
        out.extend_from_slice(&[64, 6, 0, 0]);
        out.extend_from_slice(&src.octets());
        out.extend_from_slice(&dst.octets());
        out.extend_from_slice(payload);
        out
    }

    fn whole(payload: &[u8]) -> Vec<u8> {
        datagram(CLIENT, SERVER, 1, 0, false, payload)
    }

    #[test]
    fn passes_matching_datagram() {
        let mut ip = IpDefragmenter::tcp(CLIENT, SERVER);
        ip.ingest(&whole(b"hello"), 100);
        assert_eq!(
            ip.next_payload(),
            Some(IpPayload {
                epoch: 100,
                data: Bytes::from_static(b"hello")
            })
        );
        assert!(ip.next_payload().is_none());
    }

    #[test]
    fn filters_other_direction() {
        let mut ip = IpDefragmenter::tcp(CLIENT, SERVER);
        ip.ingest(&datagram(SERVER, CLIENT, 1, 0, false, b"reply"), 1);
        assert!(ip.next_payload().is_none());
    }

    #[test]
    fn splits_concatenated_datagrams_and_buffers_tail() {
        let mut ip = IpDefragmenter::tcp(CLIENT, SERVER);
        let mut frame = whole(b"one");
        let second = whole(b"two");
        frame.extend_from_slice(&second[..10]);

        ip.ingest(&frame, 10);
        assert_eq!(ip.next_payload().unwrap().data, Bytes::from_static(b"one"));
        assert!(ip.next_payload().is_none());
        assert_eq!(ip.pending_len(), 10);

        ip.ingest(&second[10..], 20);
        let tail = ip.next_payload().unwrap();
        assert_eq!(tail.data, Bytes::from_static(b"two"));
        assert_eq!(tail.epoch, 10);
    }

    #[test]
    fn reassembles_out_of_order_fragments_with_earliest_epoch() {
        let payload: Vec<u8> = (0..40u8).collect();
        let mut ip = IpDefragmenter::tcp(CLIENT, SERVER);

        ip.ingest(&datagram(CLIENT, SERVER, 7, 32, false, &payload[32..]), 300);
        ip.ingest(&datagram(CLIENT, SERVER, 7, 0, true, &payload[..16]), 200);
        assert!(ip.next_payload().is_none());
        ip.ingest(&datagram(CLIENT, SERVER, 7, 16, true, &payload[16..32]), 400);

        let out = ip.next_payload().unwrap();
        assert_eq!(&out.data[..], &payload[..]);
        assert_eq!(out.epoch, 200);
        assert_eq!(ip.fragment_sets(), 0);
    }

    #[test]
    fn malformed_header_discards_buffer() {
        let mut ip = IpDefragmenter::tcp(CLIENT, SERVER);
        let mut frame = whole(b"abc");
        frame[0] = 0x65;
        ip.ingest(&frame, 1);
        assert!(ip.next_payload().is_none());
        assert_eq!(ip.pending_len(), 0);

        let mut short_total = whole(b"abc");
        short_total[2..4].copy_from_slice(&10u16.to_be_bytes());
        ip.ingest(&short_total, 2);
        assert_eq!(ip.pending_len(), 0);
    }

    #[test]
    fn trailing_padding_does_not_swallow_the_next_datagram() {
        let mut ip = IpDefragmenter::tcp(SERVER, CLIENT);
        // A bare ACK padded to the Ethernet minimum.
        let mut padded_ack = datagram(CLIENT, SERVER, 1, 0, false, &[0u8; 20]);
        padded_ack.extend_from_slice(&[0u8; 6]);
        ip.ingest(&padded_ack, 1);
        assert_eq!(ip.pending_len(), 0);

        ip.ingest(&datagram(SERVER, CLIENT, 2, 0, false, b"reply"), 2);
        assert_eq!(
            ip.next_payload().map(|payload| payload.data),
            Some(Bytes::from_static(b"reply"))
        );
    }

    #[test]
    fn short_tail_with_ipv4_start_is_kept() {
        let mut ip = IpDefragmenter::tcp(CLIENT, SERVER);
        let second = whole(b"next");
        let mut frame = whole(b"first");
        frame.extend_from_slice(&second[..4]);
        ip.ingest(&frame, 1);
        assert_eq!(ip.pending_len(), 4);

        ip.ingest(&second[4..], 2);
        ip.next_payload();
        assert_eq!(ip.next_payload().unwrap().data, Bytes::from_static(b"next"));
    }

    #[test]
    fn stale_fragment_sets_are_evicted() {
        let mut ip = IpDefragmenter::tcp(CLIENT, SERVER);
        ip.ingest(&datagram(CLIENT, SERVER, 1, 0, true, &[0u8; 8]), 0);
        assert_eq!(ip.fragment_sets(), 1);
        ip.ingest(
            &datagram(CLIENT, SERVER, 2, 0, true, &[0u8; 8]),
            FRAGMENT_TIMEOUT_MS + 1,
        );
        assert_eq!(ip.fragment_sets(), 1);
    }

    #[test]
    fn fragment_set_count_is_bounded() {
        let mut ip = IpDefragmenter::tcp(CLIENT, SERVER);
        for id in 0..(MAX_FRAGMENT_SETS as u16 + 10) {
            ip.ingest(&datagram(CLIENT, SERVER, id, 0, true, &[0u8; 8]), i64::from(id));
        }
        assert_eq!(ip.fragment_sets(), MAX_FRAGMENT_SETS);
    }
}
