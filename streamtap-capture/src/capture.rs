//! ## streamtap-capture::capture
//! **Capture socket contract and backend selection**

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use streamtap_core::alloc::{BufferPool, PoolPolicy, PoolSnapshot};
use streamtap_core::time::EpochClock;

use crate::compat::CompatMode;
use crate::error::CaptureError;
use crate::packet::CapturedFrame;
use crate::pcap_capture::PcapCaptureSocket;
use crate::raw_socket::RawCaptureSocket;

/// Passive capture of the traffic of one local IPv4 address.
pub trait CaptureSocket: Send {
    /// Binds to `local` (and filters on `remote` when given) and starts
    /// receiving.
    fn start(&mut self, local: Ipv4Addr, remote: Option<Ipv4Addr>) -> Result<(), CaptureError>;

    /// Next received frame, if any. Never blocks.
    fn poll_next(&mut self) -> Option<CapturedFrame>;

    /// Stops receiving and releases the socket. Idempotent.
    fn stop(&mut self);

    /// `false` once the receive path hit an unexpected error.
    fn is_healthy(&self) -> bool;

    fn local_addr(&self) -> Option<Ipv4Addr>;

    /// Counters of the receive buffer pool while started.
    fn pool_stats(&self) -> Option<PoolSnapshot> {
        None
    }
}

/// Available capture backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureBackend {
    #[default]
    RawSocket,
    Pcap,
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub pool_buffers: usize,
    pub buffer_size: usize,
    pub pool_policy: PoolPolicy,
    pub compat: CompatMode,
    pub read_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            pool_buffers: 20,
            buffer_size: 64 * 1024 + 1,
            pool_policy: PoolPolicy::Bounded,
            compat: CompatMode::Auto,
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl CaptureOptions {
    pub(crate) fn build_pool(&self) -> Result<BufferPool, CaptureError> {
        Ok(BufferPool::new(
            self.pool_buffers,
            self.buffer_size,
            self.pool_policy,
        )?)
    }
}

/// Creates an unstarted capture socket for `backend`.
pub fn open_capture(
    backend: CaptureBackend,
    options: CaptureOptions,
    clock: Arc<dyn EpochClock>,
) -> Box<dyn CaptureSocket> {
    match backend {
        CaptureBackend::RawSocket => Box::new(RawCaptureSocket::new(options, clock)),
        CaptureBackend::Pcap => Box::new(PcapCaptureSocket::new(options, clock)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamtap_core::time::SystemClock;

    #[test]
    fn defaults_match_capture_sizing() {
        let options = CaptureOptions::default();
        assert_eq!(options.pool_buffers, 20);
        assert_eq!(options.buffer_size, 65537);
        assert_eq!(options.pool_policy, PoolPolicy::Bounded);
    }

    #[test]
    fn unstarted_sockets_report_no_address() {
        for backend in [CaptureBackend::RawSocket, CaptureBackend::Pcap] {
            let mut socket = open_capture(backend, CaptureOptions::default(), Arc::new(SystemClock));
            assert!(socket.local_addr().is_none());
            assert!(socket.poll_next().is_none());
            assert!(socket.pool_stats().is_none());
            socket.stop();
            socket.stop();
        }
    }
}
