//! ## streamtap-capture::pcap_capture
//! **Kernel-assisted capture backend**
//!
//! Captures on the device that owns the monitored address with a BPF filter
//! on that address. Link-layer headers are stripped according to the
//! datalink type and each frame is trimmed to its IPv4 total length, so
//! consumers see the same datagrams the raw-socket backend delivers.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use etherparse::{
    EtherType, Ethernet2Header, Ethernet2HeaderSlice, Ipv4HeaderSlice, SingleVlanHeader,
    SingleVlanHeaderSlice,
};
use pcap::{Active, Capture, Device, Linktype};
use streamtap_core::alloc::PoolSnapshot;
use streamtap_core::time::EpochClock;
use tracing::info;

use crate::capture::{CaptureOptions, CaptureSocket};
use crate::error::CaptureError;
use crate::packet::CapturedFrame;
use crate::receiver::{CaptureWorker, FrameSource};

const ETHERTYPE_IPV4: u16 = 0x0800;

struct PcapSource {
    capture: Capture<Active>,
    linktype: Linktype,
}

impl FrameSource for PcapSource {
    fn recv_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.capture.next_packet() {
            Ok(packet) => match strip_link_layer(self.linktype, packet.data) {
                Some(ip) => {
                    let len = ip.len().min(buf.len());
                    buf[..len].copy_from_slice(&ip[..len]);
                    Ok(len)
                }
                None => Ok(0),
            },
            Err(pcap::Error::TimeoutExpired) => Err(io::ErrorKind::TimedOut.into()),
            Err(e) => Err(io::Error::other(e.to_string())),
        }
    }
}

/// Returns the IPv4 datagram inside a captured link-layer frame, or `None`
/// for non-IPv4 traffic and unknown link types. Anything after the IPv4
/// total length (Ethernet minimum-size padding, trailers) is cut off.
pub fn strip_link_layer(linktype: Linktype, data: &[u8]) -> Option<&[u8]> {
    let network = match linktype {
        Linktype(1) => ethernet_payload(data)?,
        // Linux cooked capture v1
        Linktype(113) => (be_u16(data, 14)? == ETHERTYPE_IPV4).then(|| &data[16..])?,
        // Linux cooked capture v2
        Linktype(276) => {
            if data.len() < 20 {
                return None;
            }
            (be_u16(data, 0)? == ETHERTYPE_IPV4).then(|| &data[20..])?
        }
        // BSD null / OpenBSD loopback: 4-byte family header
        Linktype(0) | Linktype(108) => data.get(4..)?,
        // Raw IP
        Linktype(12) | Linktype(14) | Linktype(101) | Linktype(228) => data,
        _ => return None,
    };
    trim_to_datagram(network)
}

/// Ethernet II, with at most one VLAN tag.
fn ethernet_payload(data: &[u8]) -> Option<&[u8]> {
    let ethernet = Ethernet2HeaderSlice::from_slice(data).ok()?;
    let rest = &data[Ethernet2Header::LEN..];
    let ether_type = ethernet.ether_type();
    if ether_type == EtherType::IPV4 {
        return Some(rest);
    }
    if ether_type == EtherType::VLAN_TAGGED_FRAME {
        let vlan = SingleVlanHeaderSlice::from_slice(rest).ok()?;
        return (vlan.ether_type() == EtherType::IPV4).then(|| &rest[SingleVlanHeader::LEN..]);
    }
    None
}

/// A snaplen-truncated datagram keeps what was captured.
fn trim_to_datagram(ip: &[u8]) -> Option<&[u8]> {
    let header = Ipv4HeaderSlice::from_slice(ip).ok()?;
    let total = usize::from(header.total_len());
    Some(&ip[..total.min(ip.len())])
}

#[inline]
fn be_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub struct PcapCaptureSocket {
    options: CaptureOptions,
    clock: Arc<dyn EpochClock>,
    worker: Option<CaptureWorker>,
    local: Option<Ipv4Addr>,
}

impl PcapCaptureSocket {
    pub fn new(options: CaptureOptions, clock: Arc<dyn EpochClock>) -> Self {
        Self {
            options,
            clock,
            worker: None,
            local: None,
        }
    }

    fn device_for(local: Ipv4Addr) -> Result<Device, CaptureError> {
        Device::list()?
            .into_iter()
            .find(|device| {
                device
                    .addresses
                    .iter()
                    .any(|address| address.addr == IpAddr::V4(local))
            })
            .ok_or(CaptureError::DeviceNotFound(local))
    }

    fn open(&self, local: Ipv4Addr, remote: Option<Ipv4Addr>) -> Result<PcapSource, CaptureError> {
        let device = Self::device_for(local)?;
        let snaplen = i32::try_from(self.options.buffer_size).unwrap_or(i32::MAX);
        let timeout = i32::try_from(self.options.read_timeout.as_millis()).unwrap_or(i32::MAX);

        let mut capture = Capture::from_device(device)?
            .promisc(true)
            .snaplen(snaplen)
            .timeout(timeout)
            .immediate_mode(true)
            .open()?;
        capture.filter(&bpf_filter(local, remote), true)?;

        let linktype = capture.get_datalink();
        Ok(PcapSource { capture, linktype })
    }
}

fn bpf_filter(local: Ipv4Addr, remote: Option<Ipv4Addr>) -> String {
    match remote {
        Some(remote) => format!("ip host {local} and host {remote}"),
        None => format!("ip host {local}"),
    }
}

impl CaptureSocket for PcapCaptureSocket {
    fn start(&mut self, local: Ipv4Addr, remote: Option<Ipv4Addr>) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }

        let source = self.open(local, remote)?;
        let linktype = source.linktype;
        let pool = self.options.build_pool()?;
        let worker =
            CaptureWorker::spawn("streamtap-pcap-capture", source, pool, Arc::clone(&self.clock))?;

        info!(%local, ?remote, linktype = linktype.0, "Pcap capture started");
        self.worker = Some(worker);
        self.local = Some(local);
        Ok(())
    }

    fn poll_next(&mut self) -> Option<CapturedFrame> {
        self.worker.as_ref().and_then(CaptureWorker::poll_next)
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            info!(local = ?self.local, "Pcap capture stopped");
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

impl Drop for PcapCaptureSocket {
    fn drop(&mut self) {
        self.stop();
    }
}
