//! Connection identity.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

/// Stable identity of a TCP connection, formatted as
/// `local_ip:local_port=>remote_ip:remote_port`.
///
/// Cloning is cheap; events carry one per message.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    pub fn new(local: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self(Arc::from(format!("{local}=>{remote}")))
    }

    pub fn from_parts(local_ip: Ipv4Addr, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16) -> Self {
        Self::new(
            SocketAddrV4::new(local_ip, local_port),
            SocketAddrV4::new(remote_ip, remote_port),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}
