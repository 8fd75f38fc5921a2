//! Shared fixtures: a scripted capture socket, a scripted connection
//! provider and builders for IPv4/TCP/bundle bytes.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use streamtap_capture::{CaptureError, CaptureSocket, CapturedFrame};
use streamtap_core::alloc::{BufferPool, PoolPolicy, PoolSnapshot};
use streamtap_engine::{
    ConnectionDescriptor, ConnectionProvider, DiscoveryError, MonitorSettings, NetworkMonitor,
    PipelineFactory, ProviderFactory, SocketFactory,
};
use streamtap_protocols::{
    BundleFormat, BundleLayout, Decompressor, ProtocolError, TcpLimits, DEFAULT_MAGIC,
};

pub const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);
pub const CLIENT_PORT: u16 = 50000;
pub const SERVER_PORT: u16 = 7000;

/// A frame on the wire. Tagged frames are only seen by a socket bound to
/// that local address.
struct WireFrame {
    local: Option<Ipv4Addr>,
    data: Vec<u8>,
    epoch: i64,
}

/// Frames waiting to be "captured", plus a log of socket lifecycle calls.
#[derive(Clone, Default)]
pub struct Wire {
    frames: Arc<Mutex<VecDeque<WireFrame>>>,
    pub log: Arc<Mutex<Vec<String>>>,
    pub unhealthy: Arc<AtomicBool>,
}

impl Wire {
    /// Visible to whatever address the socket is bound to.
    pub fn push(&self, frame: Vec<u8>, epoch: i64) {
        self.frames.lock().push_back(WireFrame {
            local: None,
            data: frame,
            epoch,
        });
    }

    /// Visible only to a socket bound to `local`.
    pub fn push_to(&self, local: Ipv4Addr, frame: Vec<u8>, epoch: i64) {
        self.frames.lock().push_back(WireFrame {
            local: Some(local),
            data: frame,
            epoch,
        });
    }

    /// Frames no socket has taken yet.
    pub fn pending(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn socket_factory(&self) -> SocketFactory {
        let wire = self.clone();
        Arc::new(move || {
            Box::new(ScriptedSocket {
                wire: wire.clone(),
                pool: BufferPool::new(8, 2048, PoolPolicy::Grow).expect("pool"),
                local: None,
            }) as Box<dyn CaptureSocket>
        })
    }
}

pub struct ScriptedSocket {
    wire: Wire,
    pool: BufferPool,
    local: Option<Ipv4Addr>,
}

impl CaptureSocket for ScriptedSocket {
    fn start(&mut self, local: Ipv4Addr, _remote: Option<Ipv4Addr>) -> Result<(), CaptureError> {
        if self.local.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }
        self.wire.log.lock().push(format!("start {local}"));
        self.local = Some(local);
        Ok(())
    }

    fn poll_next(&mut self) -> Option<CapturedFrame> {
        let local = self.local?;
        let frame = {
            let mut frames = self.wire.frames.lock();
            let index = frames
                .iter()
                .position(|frame| frame.local.map_or(true, |tag| tag == local))?;
            frames.remove(index)?
        };
        let mut buffer = self.pool.try_acquire()?;
        buffer.spare_mut()[..frame.data.len()].copy_from_slice(&frame.data);
        buffer.set_len(frame.data.len());
        Some(CapturedFrame::new(buffer, frame.epoch))
    }

    fn stop(&mut self) {
        if let Some(local) = self.local.take() {
            self.wire.log.lock().push(format!("stop {local}"));
        }
    }

    fn is_healthy(&self) -> bool {
        !self.wire.unhealthy.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> Option<Ipv4Addr> {
        self.local
    }

    fn pool_stats(&self) -> Option<PoolSnapshot> {
        self.local.map(|_| self.pool.stats().snapshot())
    }
}

/// Provider whose snapshot the test can swap at any time.
#[derive(Clone, Default)]
pub struct Connections(pub Arc<Mutex<Vec<ConnectionDescriptor>>>);

impl Connections {
    pub fn set(&self, snapshot: Vec<ConnectionDescriptor>) {
        *self.0.lock() = snapshot;
    }

    pub fn factory(&self) -> ProviderFactory {
        let shared = self.clone();
        Arc::new(move || Box::new(shared.clone()) as Box<dyn ConnectionProvider>)
    }
}

impl ConnectionProvider for Connections {
    fn snapshot(&mut self) -> Result<Vec<ConnectionDescriptor>, DiscoveryError> {
        Ok(self.0.lock().clone())
    }
}

pub fn client_connection(local: Ipv4Addr) -> ConnectionDescriptor {
    ConnectionDescriptor::tcp(
        SocketAddrV4::new(local, CLIENT_PORT),
        SocketAddrV4::new(SERVER, SERVER_PORT),
    )
}

/// Test codec: the compressed form is the body reversed.
pub struct ReverseDecompressor;

impl Decompressor for ReverseDecompressor {
    fn decompress(&mut self, input: &[u8], _decompressed_len: usize) -> Result<Vec<u8>, ProtocolError> {
        Ok(input.iter().rev().copied().collect())
    }
}

pub fn fast_settings() -> MonitorSettings {
    MonitorSettings {
        idle_poll: Duration::from_millis(5),
        cycle_sleep: Duration::from_millis(1),
        stop_timeout: Duration::from_secs(5),
        local_ip: None,
    }
}

/// Default layout, reversing codec and default reassembly limits.
pub fn pipelines() -> PipelineFactory {
    let format = Arc::new(BundleFormat::new(BundleLayout::default()).expect("layout"));
    PipelineFactory::new(
        format,
        Arc::new(|| Some(Box::new(ReverseDecompressor) as Box<dyn Decompressor>)),
        TcpLimits::default(),
    )
}

pub fn monitor(wire: &Wire, connections: &Connections) -> NetworkMonitor {
    monitor_with(fast_settings(), wire, connections.factory())
}

pub fn monitor_with(settings: MonitorSettings, wire: &Wire, provider: ProviderFactory) -> NetworkMonitor {
    NetworkMonitor::new(settings, pipelines(), wire.socket_factory()).with_provider(provider)
}

/// Polls `condition` until it holds or five seconds pass.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// One bundle frame in the default layout. `compress` reverses the body.
pub fn bundle(messages: &[&[u8]], compress: bool) -> Vec<u8> {
    let mut body = Vec::new();
    for message in messages {
        body.extend_from_slice(&((message.len() + 4) as u32).to_le_bytes());
        body.extend_from_slice(message);
    }
    let decompressed_len = body.len() as u32;
    if compress {
        body.reverse();
    }

    let mut frame = vec![0u8; 40];
    frame[..16].copy_from_slice(&DEFAULT_MAGIC);
    frame[24..28].copy_from_slice(&((40 + body.len()) as u32).to_le_bytes());
    frame[30..32].copy_from_slice(&(messages.len() as u16).to_le_bytes());
    frame[33] = compress as u8;
    frame[36..40].copy_from_slice(&decompressed_len.to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

pub fn tcp_segment(sport: u16, dport: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + payload.len());
    out.extend_from_slice(&sport.to_be_bytes());
    out.extend_from_slice(&dport.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.push(0x50);
    out.push(0x18);
    out.extend_from_slice(&[0xff, 0xff, 0, 0, 0, 0]);
    out.extend_from_slice(payload);
    out
}

/// IPv4 datagram (or fragment) carrying TCP. `offset` is in bytes and must
/// be a multiple of eight.
pub fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, id: u16, offset: usize, more: bool, payload: &[u8]) -> Vec<u8> {
    let mut flags_offset = (offset / 8) as u16;
    if more {
        flags_offset |= 0x2000;
    }
    let mut out = vec![0x45, 0x00];
    out.extend_from_slice(&((20 + payload.len()) as u16).to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&flags_offset.to_be_bytes());
    out.extend_from_slice(&[64, 6, 0, 0]);
    out.extend_from_slice(&src.octets());
    out.extend_from_slice(&dst.octets());
    out.extend_from_slice(payload);
    out
}

/// Splits `payload` into fragments of `chunk` bytes (a multiple of eight).
pub fn fragments(src: Ipv4Addr, dst: Ipv4Addr, id: u16, payload: &[u8], chunk: usize) -> Vec<Vec<u8>> {
    let pieces: Vec<&[u8]> = payload.chunks(chunk).collect();
    let last = pieces.len() - 1;
    pieces
        .iter()
        .enumerate()
        .map(|(index, piece)| ipv4(src, dst, id, index * chunk, index != last, piece))
        .collect()
}
