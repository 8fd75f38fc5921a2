//! ## streamtap-capture::raw_socket
//! **Raw IPv4 socket backend**
//!
//! Opens a `socket2` raw socket bound to the monitored local address and
//! connected to the remote peer when one is known. Each receive yields a
//! complete IPv4 datagram including its header.

use std::io::{self, Read};
use std::net::{Ipv4Addr, Shutdown, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, SockAddr, Socket, Type};
use streamtap_core::alloc::PoolSnapshot;
use streamtap_core::time::EpochClock;
use tracing::{debug, info, warn};

use crate::capture::{CaptureOptions, CaptureSocket};
use crate::error::CaptureError;
use crate::packet::CapturedFrame;
use crate::receiver::{CaptureWorker, FrameSource};

struct SocketSource(Arc<Socket>);

impl FrameSource for SocketSource {
    fn recv_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self.0).read(buf)
    }
}

pub struct RawCaptureSocket {
    options: CaptureOptions,
    clock: Arc<dyn EpochClock>,
    socket: Option<Arc<Socket>>,
    worker: Option<CaptureWorker>,
    local: Option<Ipv4Addr>,
}

impl RawCaptureSocket {
    pub fn new(options: CaptureOptions, clock: Arc<dyn EpochClock>) -> Self {
        Self {
            options,
            clock,
            socket: None,
            worker: None,
            local: None,
        }
    }

    fn open_socket(&self, local: Ipv4Addr, remote: Option<Ipv4Addr>) -> io::Result<Socket> {
        let protocol = self.options.compat.protocol();
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(protocol))?;
        socket.set_read_timeout(Some(self.options.read_timeout))?;
        #[allow(deprecated)]
        if let Err(e) = socket.set_header_included(true) {
            debug!(error = %e, "IP_HDRINCL not available");
        }
        socket.bind(&SockAddr::from(SocketAddrV4::new(local, 0)))?;
        if let Some(remote) = remote {
            socket.connect(&SockAddr::from(SocketAddrV4::new(remote, 0)))?;
        }
        Ok(socket)
    }
}

impl CaptureSocket for RawCaptureSocket {
    fn start(&mut self, local: Ipv4Addr, remote: Option<Ipv4Addr>) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }

        let socket = Arc::new(self.open_socket(local, remote)?);
        let pool = self.options.build_pool()?;
        let worker = CaptureWorker::spawn(
            "streamtap-raw-capture",
            SocketSource(Arc::clone(&socket)),
            pool,
            Arc::clone(&self.clock),
        )?;

        info!(%local, ?remote, compat = self.options.compat.use_compat(), "Raw capture started");
        if cfg!(target_os = "linux") {
            warn!("Raw sockets on Linux only see inbound traffic; use the pcap backend to capture both directions");
        }
        self.socket = Some(socket);
        self.worker = Some(worker);
        self.local = Some(local);
        Ok(())
    }

    fn poll_next(&mut self) -> Option<CapturedFrame> {
        self.worker.as_ref().and_then(CaptureWorker::poll_next)
    }

    fn stop(&mut self) {
        if let Some(socket) = self.socket.take() {
            // Fails with ENOTCONN on an unconnected raw socket; the read
            // timeout still bounds the receive thread.
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                debug!(error = %e, "Raw socket shutdown");
            }
        }
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            info!(local = ?self.local, "Raw capture stopped");
        }
        self.local = None;
    }

    fn is_healthy(&self) -> bool {
        self.worker.as_ref().map_or(true, CaptureWorker::is_healthy)
    }

    fn local_addr(&self) -> Option<Ipv4Addr> {
        self.local
    }

    fn pool_stats(&self) -> Option<PoolSnapshot> {
        self.worker.as_ref().map(|worker| worker.pool().stats().snapshot())
    }
}

impl Drop for RawCaptureSocket {
    fn drop(&mut self) {
        self.stop();
    }
}
