//! VeloGuard Sinkhole - packet-processing session engine for a local VPN firewall
//!
//! Raw IP packets read from a tun device are decoded, checked against a
//! host policy and relayed through ordinary sockets. Replies are framed
//! back into IP packets and written to the tun. Nothing leaves the device
//! that the policy did not allow, and DNS lookups for blocked names are
//! answered locally.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                   Local applications                        |
//! +-------------------------------------------------------------+
//!                              | tun
//!                              v
//! +-------------------------------------------------------------+
//! |                   Engine (mio loop)                         |
//! | +-------------+ +-------------+ +-------------+             |
//! | | ICMP relay  | | UDP relay   | | TCP proxy   |             |
//! | |             | | DNS inspect | |             |             |
//! | +-------------+ +-------------+ +-------------+             |
//! |          |             |              |                     |
//! | +-----------------------------------------------------+    |
//! | |  Packet decoder / wire codec / session table        |    |
//! | +-----------------------------------------------------+    |
//! |          | policy, owner, observer, protector (host)        |
//! +-------------------------------------------------------------+
//!                              | protected sockets
//!                              v
//! +-------------------------------------------------------------+
//! |         Network (direct, redirected or SOCKS5)              |
//! +-------------------------------------------------------------+
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use veloguard_sinkhole::prelude::*;
//!
//! let tun = TunFd::open("vg0")?;
//! let config = EngineConfig::builder().mtu(1500).build()?;
//! let mut engine = Engine::new(config, tun, Collaborators::default())?;
//! let handle = engine.handle();
//! std::thread::spawn(move || engine.run());
//! // later
//! handle.stop();
//! ```

pub mod checksum;
pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod icmp;
pub mod packet;
pub mod policy;
pub mod protect;
pub mod relay;
pub mod session;
pub mod socks5;
pub mod stats;
pub mod tcp;
pub mod tun;
pub mod udp;
pub mod wire;

#[cfg(test)]
mod tests;

pub use config::{DnsConfig, EngineConfig, EngineConfigBuilder, Socks5Config, TcpTimeouts, UdpTimeouts};
pub use dns::{BlockResponse, DnsAnswer, DnsQuery, DnsResponse};
pub use engine::{Engine, EngineHandle};
pub use error::{Result, SinkholeError};
pub use packet::{IpVersion, Packet, TcpFlags, Transport};
pub use policy::{
    AllowAll, Collaborators, FlowQuery, NoOwner, Observer, OwnerResolver, PacketLog, PolicyEngine,
    ProcNetResolver, RedirectTarget, RuleSetPolicy, TracingObserver, Usage,
};
pub use protect::{
    clear_protect_callback, has_protect_callback, set_protect_callback, CallbackProtector, GlobalProtector, NoProtect,
    SocketProtector,
};
pub use session::{FlowKey, Session, SessionCounts, SessionTable};
pub use stats::{EngineStats, StatsSnapshot};
pub use tun::{TunDevice, TunFd};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Engine, EngineHandle};
    pub use crate::error::{Result, SinkholeError};
    pub use crate::policy::{Collaborators, PolicyEngine, RuleSetPolicy};
    pub use crate::tun::{TunDevice, TunFd};
}
