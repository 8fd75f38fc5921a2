//! ## streamtap-capture::compat
//! **Raw socket compatibility path**
//!
//! The native raw-socket path asks for every IP datagram (protocol 0). Where
//! the platform refuses that, the compatibility path opens the socket with
//! protocol TCP instead, which still yields full IPv4 datagrams for the
//! traffic this tool decodes.

use socket2::Protocol;
#[cfg(not(target_os = "linux"))]
use socket2::{Domain, Socket, Type};

/// Environment variable that forces the compatibility path when set to `1`.
pub const COMPAT_ENV: &str = "STREAMTAP_RAW_SOCKET_COMPAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompatMode {
    /// Use the compatibility path only when the platform needs it.
    #[default]
    Auto,
    Forced,
    Disabled,
}

impl CompatMode {
    /// Resolves the mode to a decision. The environment override wins over
    /// everything else.
    pub fn use_compat(self) -> bool {
        if env_forces_compat() {
            return true;
        }
        match self {
            CompatMode::Forced => true,
            CompatMode::Disabled => false,
            CompatMode::Auto => !native_raw_ip_supported(),
        }
    }

    pub fn protocol(self) -> Protocol {
        if self.use_compat() {
            Protocol::TCP
        } else {
            Protocol::from(0)
        }
    }
}

fn env_forces_compat() -> bool {
    std::env::var(COMPAT_ENV).map(|v| v.trim() == "1").unwrap_or(false)
}

/// Linux rejects raw sockets with protocol 0, so the native path never works
/// there.
#[cfg(target_os = "linux")]
fn native_raw_ip_supported() -> bool {
    false
}

#[cfg(not(target_os = "linux"))]
fn native_raw_ip_supported() -> bool {
    match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(0))) {
        Ok(_) => true,
        // Lacking privileges says nothing about protocol support; let the real
        // bind report it.
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_and_disabled_are_explicit() {
        if env_forces_compat() {
            return;
        }
        assert!(CompatMode::Forced.use_compat());
        assert!(!CompatMode::Disabled.use_compat());
        assert_eq!(CompatMode::Forced.protocol(), Protocol::TCP);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn auto_uses_compat_on_linux() {
        assert!(CompatMode::Auto.use_compat());
    }
}
