//! Resolve the uid that owns a local socket.
//!
//! On Linux the kernel exposes every socket in `/proc/net/{tcp,udp,icmp}[6]`
//! with its local address and owning uid. Other platforms report
//! [`Sock2ProcError::NotImplemented`].

use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum Sock2ProcError {
    #[error("Socket not found")]
    SocketNotFound,
    #[error("Invalid socket table entry: {0}")]
    InvalidEntry(String),
    #[error("Unsupported protocol {0} for IPv{1}")]
    UnsupportedProtocol(u8, u8),
    #[error("System error: {0}")]
    SystemError(String),
    #[error("Not implemented for this platform")]
    NotImplemented,
}

/// Transport protocol numbers understood by the resolver.
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;

/// Look up the uid owning the socket bound to `addr:port`.
///
/// A port match is enough; an exact address match wins over a wildcard.
pub fn find_socket_uid(protocol: u8, addr: IpAddr, port: u16) -> Result<u32, Sock2ProcError> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        platform::linux::find_socket_uid(protocol, addr, port)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = (protocol, addr, port);
        Err(Sock2ProcError::NotImplemented)
    }
}

/// Retrying uid lookup.
///
/// The kernel table may lag behind the first packet of a flow, so the
/// resolver waits `initial_delay` and then tries up to `max_tries` times.
#[derive(Debug, Clone)]
pub struct UidResolver {
    pub initial_delay: Duration,
    pub retry_delay: Duration,
    pub max_tries: u32,
}

impl Default for UidResolver {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            retry_delay: Duration::from_millis(10),
            max_tries: 3,
        }
    }
}

impl UidResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, protocol: u8, addr: IpAddr, port: u16) -> Option<u32> {
        std::thread::sleep(self.initial_delay);
        for attempt in 1..=self.max_tries {
            if let Some(uid) = self.lookup_once(protocol, addr, port) {
                return Some(uid);
            }
            if attempt < self.max_tries {
                debug!("uid {}/{} proto {} try {}", addr, port, protocol, attempt);
                std::thread::sleep(self.retry_delay);
            }
        }
        warn!("uid {}/{} proto {} not found", addr, port, protocol);
        None
    }

    fn lookup_once(&self, protocol: u8, addr: IpAddr, port: u16) -> Option<u32> {
        // Dual-stack sockets list IPv4 peers in the IPv6 table.
        if let IpAddr::V4(v4) = addr {
            if let Ok(uid) = find_socket_uid(protocol, IpAddr::V6(v4.to_ipv6_mapped()), port) {
                return Some(uid);
            }
        }
        find_socket_uid(protocol, addr, port).ok()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod platform {
    pub mod linux;
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use platform::linux::{find_uid_in_table, table_path};
