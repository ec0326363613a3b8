//! Error types for the VeloGuard sinkhole engine

use std::io;
use thiserror::Error;

/// Result type alias for sinkhole operations
pub type Result<T> = std::result::Result<T, SinkholeError>;

/// Main error type for the sinkhole engine
#[derive(Error, Debug)]
pub enum SinkholeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Fragmented packet (offset {offset})")]
    Fragmented { offset: u16 },

    #[error("Flow denied by policy")]
    PolicyDenied,

    #[error("Session limit reached: {active}/{max}")]
    SessionLimit { active: usize, max: usize },

    #[error("Peer protocol violation: {0}")]
    PeerProtocol(String),

    #[error("SOCKS5 error: {0}")]
    Socks5(String),

    #[error("SOCKS5 request rejected: {reason} ({code})")]
    Socks5Rejected { code: u8, reason: &'static str },

    #[error("Tun device error: {0}")]
    Tun(io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SinkholeError {
    /// Whether the operation may succeed on the next readiness event.
    pub fn is_transient(&self) -> bool {
        match self {
            SinkholeError::Io(e) => is_transient_io(e),
            _ => false,
        }
    }

    /// Whether the packet that caused this error was structurally invalid.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            SinkholeError::MalformedPacket(_)
                | SinkholeError::PacketTooShort { .. }
                | SinkholeError::InvalidIpVersion(_)
                | SinkholeError::Fragmented { .. }
        )
    }
}

/// WouldBlock, EINTR and ENOBUFS are retried rather than treated as failures.
pub fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || e.raw_os_error() == Some(libc::ENOBUFS)
        || e.raw_os_error() == Some(libc::EAGAIN)
}
