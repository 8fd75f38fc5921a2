//! ## streamtap-engine::connections
//! **Connection tracking across discovery snapshots**
//!
//! The provider returns an immutable snapshot every cycle. The tracker joins
//! it against what it already holds by [`ConnectionId`]: entries that are
//! still present keep their pipelines (and so their partially reassembled
//! streams), new entries get fresh pipelines, and vanished entries are
//! dropped.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use streamtap_core::events::{ConnectionId, Direction};
use tracing::{debug, info};

use crate::error::DiscoveryError;
use crate::pipeline::{DirectionPipeline, PipelineFactory, PipelineOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub protocol: TransportProtocol,
}

impl ConnectionDescriptor {
    pub fn tcp(local: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self {
            local,
            remote,
            protocol: TransportProtocol::Tcp,
        }
    }

    pub fn id(&self) -> ConnectionId {
        ConnectionId::new(self.local, self.remote)
    }
}

/// Source of the target's active connections.
pub trait ConnectionProvider: Send {
    fn snapshot(&mut self) -> Result<Vec<ConnectionDescriptor>, DiscoveryError>;
}

pub struct TrackedConnection {
    descriptor: ConnectionDescriptor,
    id: ConnectionId,
    sent: DirectionPipeline,
    received: DirectionPipeline,
}

impl TrackedConnection {
    fn new(descriptor: ConnectionDescriptor, factory: &PipelineFactory) -> Self {
        let sent = factory.build(Direction::Sent, descriptor.local, descriptor.remote);
        let received = factory.build(Direction::Received, descriptor.remote, descriptor.local);
        Self {
            id: descriptor.id(),
            descriptor,
            sent,
            received,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn pipeline(&self, direction: Direction) -> &DirectionPipeline {
        match direction {
            Direction::Sent => &self.sent,
            Direction::Received => &self.received,
        }
    }

    /// Offers `frame` to both directions. Output is appended to `sent` and
    /// `received` in stream order.
    pub fn feed(
        &mut self,
        frame: &[u8],
        epoch: i64,
        sent: &mut PipelineOutput,
        received: &mut PipelineOutput,
    ) {
        self.sent.feed(frame, epoch, sent);
        self.received.feed(frame, epoch, received);
    }

    pub fn poll(&mut self, now: i64, sent: &mut PipelineOutput, received: &mut PipelineOutput) {
        self.sent.poll(now, sent);
        self.received.poll(now, received);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshOutcome {
    /// Address the capture socket should be bound to.
    pub local_addr: Option<Ipv4Addr>,
    /// `local_addr` differs from the previous refresh.
    pub address_changed: bool,
    pub added: usize,
    pub removed: usize,
    pub active: usize,
}

pub struct ConnectionTracker {
    factory: PipelineFactory,
    local_override: Option<Ipv4Addr>,
    entries: Vec<TrackedConnection>,
    local_addr: Option<Ipv4Addr>,
}

impl ConnectionTracker {
    pub fn new(factory: PipelineFactory, local_override: Option<Ipv4Addr>) -> Self {
        Self {
            factory,
            local_override,
            entries: Vec::new(),
            local_addr: None,
        }
    }

    pub fn refresh(
        &mut self,
        provider: &mut dyn ConnectionProvider,
    ) -> Result<RefreshOutcome, DiscoveryError> {
        let snapshot = provider.snapshot()?;

        let mut existing: HashMap<ConnectionId, TrackedConnection> = self
            .entries
            .drain(..)
            .map(|entry| (entry.id.clone(), entry))
            .collect();

        let mut added = 0;
        let mut entries = Vec::with_capacity(snapshot.len());
        for descriptor in snapshot {
            let id = descriptor.id();
            if entries.iter().any(|entry: &TrackedConnection| entry.id == id) {
                continue;
            }
            match existing.remove(&id) {
                Some(entry) => entries.push(entry),
                None => {
                    debug!(connection = %id, "Tracking new connection");
                    added += 1;
                    entries.push(TrackedConnection::new(descriptor, &self.factory));
                }
            }
        }
        let removed = existing.len();
        for id in existing.keys() {
            debug!(connection = %id, "Connection closed");
        }
        self.entries = entries;

        let local_addr = self.effective_local_addr();
        let address_changed = local_addr != self.local_addr;
        if address_changed {
            match local_addr {
                Some(addr) => info!(%addr, "Monitoring local address"),
                None => info!("No active connections"),
            }
        }
        self.local_addr = local_addr;

        Ok(RefreshOutcome {
            local_addr,
            address_changed,
            added,
            removed,
            active: self.entries.len(),
        })
    }

    fn effective_local_addr(&self) -> Option<Ipv4Addr> {
        let first = self.entries.first()?.descriptor.local.ip();
        if let Some(addr) = self.local_override {
            return Some(addr);
        }
        if first.is_loopback() {
            if let Some(other) = self
                .entries
                .iter()
                .map(|entry| *entry.descriptor.local.ip())
                .find(|ip| !ip.is_loopback())
            {
                return Some(other);
            }
        }
        Some(*first)
    }

    pub fn local_addr(&self) -> Option<Ipv4Addr> {
        self.local_addr
    }

    pub fn connections(&self) -> &[TrackedConnection] {
        &self.entries
    }

    pub fn connections_mut(&mut self) -> &mut [TrackedConnection] {
        &mut self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops every tracked connection and forgets the bound address.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.local_addr = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use streamtap_protocols::{BundleFormat, BundleLayout, TcpLimits};

    pub(crate) struct StaticProvider {
        pub snapshots: Vec<Vec<ConnectionDescriptor>>,
    }

    impl ConnectionProvider for StaticProvider {
        fn snapshot(&mut self) -> Result<Vec<ConnectionDescriptor>, DiscoveryError> {
            if self.snapshots.len() > 1 {
                Ok(self.snapshots.remove(0))
            } else {
                Ok(self.snapshots.first().cloned().unwrap_or_default())
            }
        }
    }

    pub(crate) fn conn(local: [u8; 4], lport: u16, remote: [u8; 4], rport: u16) -> ConnectionDescriptor {
        ConnectionDescriptor::tcp(
            SocketAddrV4::new(Ipv4Addr::from(local), lport),
            SocketAddrV4::new(Ipv4Addr::from(remote), rport),
        )
    }

    fn tracker(local_override: Option<Ipv4Addr>) -> ConnectionTracker {
        let format = Arc::new(BundleFormat::new(BundleLayout::default()).unwrap());
        ConnectionTracker::new(PipelineFactory::without_codec(format, TcpLimits::default()), local_override)
    }

    #[test]
    fn ongoing_connection_keeps_its_entry() {
        let a = conn([10, 0, 0, 2], 50000, [10, 0, 0, 9], 7000);
        let b = conn([10, 0, 0, 2], 50001, [10, 0, 0, 9], 7001);
        let mut provider = StaticProvider {
            snapshots: vec![vec![a.clone()], vec![a.clone(), b.clone()], vec![b.clone()]],
        };
        let mut tracker = tracker(None);

        let first = tracker.refresh(&mut provider).unwrap();
        assert_eq!((first.added, first.removed, first.active), (1, 0, 1));
        assert!(first.address_changed);

        let second = tracker.refresh(&mut provider).unwrap();
        assert_eq!((second.added, second.removed, second.active), (1, 0, 2));
        assert!(!second.address_changed);
        assert_eq!(tracker.connections()[0].id(), &a.id());

        let third = tracker.refresh(&mut provider).unwrap();
        assert_eq!((third.added, third.removed, third.active), (0, 1, 1));
        assert_eq!(tracker.connections()[0].id(), &b.id());
    }

    #[test]
    fn loopback_yields_to_routable_address() {
        let mut provider = StaticProvider {
            snapshots: vec![vec![
                conn([127, 0, 0, 1], 50000, [127, 0, 0, 1], 7000),
                conn([192, 168, 1, 4], 50001, [203, 0, 113, 7], 443),
            ]],
        };
        let mut tracker = tracker(None);
        let outcome = tracker.refresh(&mut provider).unwrap();
        assert_eq!(outcome.local_addr, Some(Ipv4Addr::new(192, 168, 1, 4)));
    }

    #[test]
    fn loopback_only_stays_on_loopback() {
        let mut provider = StaticProvider {
            snapshots: vec![vec![conn([127, 0, 0, 1], 50000, [127, 0, 0, 1], 7000)]],
        };
        let outcome = tracker(None).refresh(&mut provider).unwrap();
        assert_eq!(outcome.local_addr, Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn override_wins_and_empty_snapshot_clears() {
        let forced = Ipv4Addr::new(10, 1, 1, 1);
        let mut provider = StaticProvider {
            snapshots: vec![vec![conn([10, 0, 0, 2], 50000, [10, 0, 0, 9], 7000)], vec![]],
        };
        let mut tracker = tracker(Some(forced));

        assert_eq!(tracker.refresh(&mut provider).unwrap().local_addr, Some(forced));
        let empty = tracker.refresh(&mut provider).unwrap();
        assert_eq!(empty.local_addr, None);
        assert!(empty.address_changed);
        assert!(tracker.is_empty());
    }

    #[test]
    fn duplicate_descriptors_are_tracked_once() {
        let a = conn([10, 0, 0, 2], 50000, [10, 0, 0, 9], 7000);
        let mut provider = StaticProvider {
            snapshots: vec![vec![a.clone(), a]],
        };
        let mut tracker = tracker(None);
        assert_eq!(tracker.refresh(&mut provider).unwrap().active, 1);
    }
}
