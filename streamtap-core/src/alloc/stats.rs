//! ## streamtap-core::alloc::stats
//! **Buffer pool statistics**
//!
//! Counters are atomics so the capture thread and the consumer can update
//! them without taking the pool lock.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Point-in-time copy of [`PoolStats`], for export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSnapshot {
    pub acquisitions: usize,
    pub releases: usize,
    pub grown: usize,
    pub waits: usize,
}

impl PoolSnapshot {
    pub fn outstanding(&self) -> usize {
        self.acquisitions.saturating_sub(self.releases)
    }
}

#[derive(Debug)]
pub struct PoolStats {
    acquisitions: AtomicUsize,
    releases: AtomicUsize,
    grown: AtomicUsize,
    waits: AtomicUsize,
}

impl PoolStats {
    pub fn new() -> Self {
        PoolStats {
            acquisitions: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            grown: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn increment_acquisitions(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_releases(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts buffers allocated beyond the configured capacity.
    #[inline]
    pub fn increment_grown(&self) {
        self.grown.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts times the capture path had to wait for a free buffer.
    #[inline]
    pub fn increment_waits(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::Relaxed)
    }

    pub fn grown(&self) -> usize {
        self.grown.load(Ordering::Relaxed)
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::Relaxed)
    }

    /// Buffers currently held outside the free-list.
    pub fn outstanding(&self) -> usize {
        self.acquisitions().saturating_sub(self.releases())
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            acquisitions: self.acquisitions(),
            releases: self.releases(),
            grown: self.grown(),
            waits: self.waits(),
        }
    }
}

impl Default for PoolStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = PoolStats::new();
        assert_eq!(stats.acquisitions(), 0);
        assert_eq!(stats.releases(), 0);
        assert_eq!(stats.outstanding(), 0);
    }

    #[test]
    fn outstanding_tracks_acquire_release() {
        let stats = PoolStats::new();
        for _ in 0..10 {
            stats.increment_acquisitions();
        }
        for _ in 0..4 {
            stats.increment_releases();
        }
        assert_eq!(stats.outstanding(), 6);
    }

    #[test]
    fn snapshot_copies_every_counter() {
        let stats = PoolStats::new();
        stats.increment_acquisitions();
        stats.increment_acquisitions();
        stats.increment_releases();
        stats.increment_grown();
        stats.increment_waits();
        stats.increment_waits();

        let snapshot = stats.snapshot();
        assert_eq!(
            snapshot,
            PoolSnapshot {
                acquisitions: 2,
                releases: 1,
                grown: 1,
                waits: 2,
            }
        );
        assert_eq!(snapshot.outstanding(), 1);
    }
}
