//! ## streamtap-engine::discovery
//! **Target connections from `/proc`**
//!
//! The target is resolved to a pid (directly, or by matching the process
//! name in `/proc/<pid>/comm`), its socket inodes are collected from
//! `/proc/<pid>/fd`, and established IPv4 TCP entries owning one of those
//! inodes are read from `/proc/<pid>/net/tcp`.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::connections::{ConnectionDescriptor, ConnectionProvider};
use crate::error::DiscoveryError;

const TCP_ESTABLISHED: &str = "01";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    ProcessId(u32),
    /// Process name as shown in `/proc/<pid>/comm`.
    WindowName(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::ProcessId(pid) => write!(f, "pid {pid}"),
            Target::WindowName(name) => write!(f, "process name {name:?}"),
        }
    }
}

pub struct ProcNetProvider {
    target: Target,
    root: PathBuf,
    resolved: Option<u32>,
}

impl ProcNetProvider {
    pub fn new(target: Target) -> Self {
        Self::with_root(target, "/proc")
    }

    /// Reads from `root` instead of `/proc`.
    pub fn with_root(target: Target, root: impl Into<PathBuf>) -> Self {
        Self {
            target,
            root: root.into(),
            resolved: None,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Resolves the target to a running pid, re-resolving a name once the
    /// previously matched process has exited.
    pub fn resolve(&mut self) -> Result<u32, DiscoveryError> {
        match &self.target {
            Target::ProcessId(pid) => {
                if self.root.join(pid.to_string()).is_dir() {
                    Ok(*pid)
                } else {
                    Err(DiscoveryError::ProcessNotFound(self.target.to_string()))
                }
            }
            Target::WindowName(name) => {
                if let Some(pid) = self.resolved {
                    if self.comm(pid).as_deref() == Some(name.as_str()) {
                        return Ok(pid);
                    }
                    debug!(pid, "Target process exited");
                    self.resolved = None;
                }
                let pid = self
                    .pids()?
                    .into_iter()
                    .find(|pid| self.comm(*pid).as_deref() == Some(name.as_str()))
                    .ok_or_else(|| DiscoveryError::ProcessNotFound(self.target.to_string()))?;
                info!(pid, name = %name, "Resolved target process");
                self.resolved = Some(pid);
                Ok(pid)
            }
        }
    }

    fn pids(&self) -> Result<Vec<u32>, DiscoveryError> {
        let entries = fs::read_dir(&self.root).map_err(|source| DiscoveryError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut pids: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn comm(&self, pid: u32) -> Option<String> {
        fs::read_to_string(self.root.join(pid.to_string()).join("comm"))
            .ok()
            .map(|comm| comm.trim_end().to_string())
    }

    fn socket_inodes(&self, pid: u32) -> Result<HashSet<u64>, DiscoveryError> {
        let fd_dir = self.root.join(pid.to_string()).join("fd");
        let entries = fs::read_dir(&fd_dir).map_err(|source| DiscoveryError::Io {
            path: fd_dir.clone(),
            source,
        })?;
        Ok(entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| fs::read_link(entry.path()).ok())
            .filter_map(|link| socket_inode(&link))
            .collect())
    }
}

impl ConnectionProvider for ProcNetProvider {
    fn snapshot(&mut self) -> Result<Vec<ConnectionDescriptor>, DiscoveryError> {
        let pid = match self.resolve() {
            Ok(pid) => pid,
            Err(DiscoveryError::ProcessNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let inodes = match self.socket_inodes(pid) {
            Ok(inodes) => inodes,
            Err(DiscoveryError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e),
        };
        if inodes.is_empty() {
            return Ok(Vec::new());
        }

        let table_path = self.root.join(pid.to_string()).join("net").join("tcp");
        let table = fs::read_to_string(&table_path).map_err(|source| DiscoveryError::Io {
            path: table_path.clone(),
            source,
        })?;

        Ok(parse_tcp_table(&table, &table_path)?
            .into_iter()
            .filter(|entry| entry.state == TCP_ESTABLISHED && inodes.contains(&entry.inode))
            .filter(|entry| !entry.remote.ip().is_unspecified())
            .map(|entry| ConnectionDescriptor::tcp(entry.local, entry.remote))
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TcpEntry {
    local: SocketAddrV4,
    remote: SocketAddrV4,
    state: String,
    inode: u64,
}

/// `socket:[12345]` -> 12345
fn socket_inode(link: &Path) -> Option<u64> {
    link.to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

fn parse_tcp_table(table: &str, path: &Path) -> Result<Vec<TcpEntry>, DiscoveryError> {
    table
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            parse_tcp_line(line).ok_or_else(|| DiscoveryError::Parse {
                path: path.to_path_buf(),
                line: line.trim().to_string(),
            })
        })
        .collect()
}

fn parse_tcp_line(line: &str) -> Option<TcpEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    Some(TcpEntry {
        local: parse_hex_endpoint(fields[1])?,
        remote: parse_hex_endpoint(fields[2])?,
        state: fields[3].to_string(),
        inode: fields[9].parse().ok()?,
    })
}

/// `0100007F:1F90` -> 127.0.0.1:8080. The address is the raw in-memory
/// (network order) u32 printed in host order.
fn parse_hex_endpoint(field: &str) -> Option<SocketAddrV4> {
    let (addr, port) = field.split_once(':')?;
    if addr.len() != 8 {
        return None;
    }
    let raw = u32::from_str_radix(addr, 16).ok()?;
    let port = u16::from_str_radix(port, 16).ok()?;
    Some(SocketAddrV4::new(Ipv4Addr::from(raw.to_le_bytes()), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 11111 1 0000000000000000 100 0 0 10 0
   1: 0401A8C0:C350 0771CBCB:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 22222 1 0000000000000000 20 4 30 10 -1
   2: 0401A8C0:C351 0871CBCB:01BB 06 00000000:00000000 00:00000000 00000000  1000        0 33333 1 0000000000000000 20 4 30 10 -1
";

    #[test]
    fn endpoints_decode_from_proc_format() {
        assert_eq!(
            parse_hex_endpoint("0100007F:1F90"),
            Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080))
        );
        assert_eq!(
            parse_hex_endpoint("0401A8C0:C350"),
            Some(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 4), 50000))
        );
        assert!(parse_hex_endpoint("zz:1").is_none());
    }

    #[test]
    fn table_rows_parse() {
        let entries = parse_tcp_table(TABLE, Path::new("tcp")).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].state, TCP_ESTABLISHED);
        assert_eq!(entries[1].inode, 22222);
        assert_eq!(
            entries[1].remote,
            SocketAddrV4::new(Ipv4Addr::new(203, 203, 113, 7), 443)
        );
    }

    #[test]
    fn malformed_rows_are_reported() {
        let table = "header\n   0: nonsense\n";
        assert!(matches!(
            parse_tcp_table(table, Path::new("tcp")),
            Err(DiscoveryError::Parse { .. })
        ));
    }

    #[test]
    fn socket_links_yield_inodes() {
        assert_eq!(socket_inode(Path::new("socket:[22222]")), Some(22222));
        assert_eq!(socket_inode(Path::new("pipe:[1]")), None);
        assert_eq!(socket_inode(Path::new("/dev/null")), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_process_resolves_by_pid() {
        let mut provider = ProcNetProvider::new(Target::ProcessId(std::process::id()));
        assert_eq!(provider.resolve().unwrap(), std::process::id());
        assert!(provider.snapshot().is_ok());
    }

    #[test]
    fn unknown_process_yields_empty_snapshot() {
        let mut provider = ProcNetProvider::with_root(
            Target::WindowName("no-such-process".into()),
            std::env::temp_dir().join("streamtap-missing-proc-root"),
        );
        assert!(matches!(provider.resolve(), Err(DiscoveryError::Io { .. })));

        let mut provider = ProcNetProvider::with_root(Target::ProcessId(u32::MAX), "/proc");
        assert!(provider.snapshot().unwrap().is_empty());
    }
}
