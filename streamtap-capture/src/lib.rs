//! streamtap‑capture
//!
//! Passive capture of the IPv4 traffic of one local address.
//! Two interchangeable backends implement [`CaptureSocket`]: a raw socket
//! (`socket2`) and kernel-assisted capture (`pcap`). Both hand out
//! [`CapturedFrame`]s backed by the shared buffer pool.

pub mod capture;
pub mod compat;
pub mod error;
pub mod packet;
pub mod pcap_capture;
pub mod raw_socket;
pub mod receiver;

pub use capture::{open_capture, CaptureBackend, CaptureOptions, CaptureSocket};
pub use compat::CompatMode;
pub use error::CaptureError;
pub use packet::CapturedFrame;
pub use pcap_capture::PcapCaptureSocket;
pub use raw_socket::RawCaptureSocket;
