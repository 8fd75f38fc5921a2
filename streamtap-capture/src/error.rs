use std::net::Ipv4Addr;

use streamtap_core::PoolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture socket is already running")]
    AlreadyStarted,

    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("Pcap error: {0}")]
    Pcap(String),

    #[error("No capture device owns address {0}")]
    DeviceNotFound(Ipv4Addr),

    #[error("Buffer pool error: {0}")]
    Pool(#[from] PoolError),
}

impl From<pcap::Error> for CaptureError {
    fn from(err: pcap::Error) -> Self {
        CaptureError::Pcap(err.to_string())
    }
}
