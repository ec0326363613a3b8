//! Engine configuration
//!
//! All timeouts are in whole seconds, matching the granularity of the
//! session sweep.

use crate::dns::BlockResponse;
use crate::error::{Result, SinkholeError};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Minimum IPv4 MTU every host must accept.
pub const MIN_MTU: usize = 576;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TcpTimeouts {
    /// LISTEN and SYN_RECV
    pub init: u64,
    /// ESTABLISHED, halved while a keep-alive probe is outstanding
    pub idle: u64,
    /// every other non-terminal state
    pub close: u64,
    /// how long a CLOSE session is kept before removal
    pub keep: u64,
}

impl Default for TcpTimeouts {
    fn default() -> Self {
        Self {
            init: 30,
            idle: 300,
            close: 30,
            keep: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UdpTimeouts {
    /// flows to port 53
    pub dns: u64,
    pub any: u64,
    /// how long CLOSED and BLOCKED placeholders are kept
    pub keep: u64,
    /// sessions per timeout division step
    pub scale: usize,
}

impl Default for UdpTimeouts {
    fn default() -> Self {
        Self {
            dns: 15,
            any: 300,
            keep: 60,
            scale: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Inspect port 53 traffic for blocked names.
    pub intercept: bool,
    pub block_response: BlockResponse,
    /// TTL of the synthetic sinkhole answer.
    pub ttl: u32,
    /// Ask the policy engine about port 53 flows as well.
    pub filter_flows: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            intercept: true,
            block_response: BlockResponse::NxDomain,
            ttl: 600,
            filter_flows: false,
        }
    }
}

/// Upstream SOCKS5 proxy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Socks5Config {
    pub address: SocketAddr,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Relay UDP through UDP ASSOCIATE as well.
    #[serde(default)]
    pub udp: bool,
}

impl Socks5Config {
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) if !u.is_empty() => Some((u.clone(), p.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mtu: usize,
    /// Session ceiling; three quarters of the descriptor limit when unset.
    pub max_sessions: Option<usize>,
    /// Upper bound of a single poll wait, seconds.
    pub select_timeout: u64,
    /// Lower bound of a single poll wait, milliseconds.
    pub min_check_interval_ms: u64,
    pub verify_ip_checksum: bool,
    /// Packets read from the tun per loop pass before re-polling.
    pub tun_read_budget: usize,
    pub icmp_timeout: u64,
    pub tcp: TcpTimeouts,
    pub udp: UdpTimeouts,
    pub dns: DnsConfig,
    pub socks5: Option<Socks5Config>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: 10000,
            max_sessions: None,
            select_timeout: 10,
            min_check_interval_ms: 100,
            verify_ip_checksum: true,
            tun_read_budget: 64,
            icmp_timeout: 5,
            tcp: TcpTimeouts::default(),
            udp: UdpTimeouts::default(),
            dns: DnsConfig::default(),
            socks5: None,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    pub fn select_timeout(&self) -> Duration {
        Duration::from_secs(self.select_timeout)
    }

    pub fn min_check_interval(&self) -> Duration {
        Duration::from_millis(self.min_check_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mtu < MIN_MTU || self.mtu > u16::MAX as usize {
            return Err(SinkholeError::Config(format!("mtu {} out of range", self.mtu)));
        }
        if self.udp.scale == 0 {
            return Err(SinkholeError::Config("udp.scale must be positive".into()));
        }
        if self.max_sessions == Some(0) {
            return Err(SinkholeError::Config("max_sessions must be positive".into()));
        }
        if self.tun_read_budget == 0 {
            return Err(SinkholeError::Config("tun_read_budget must be positive".into()));
        }
        if self.min_check_interval() > self.select_timeout() {
            return Err(SinkholeError::Config(
                "min_check_interval_ms exceeds select_timeout".into(),
            ));
        }
        if let Some(socks5) = &self.socks5 {
            let too_long = |s: &Option<String>| s.as_ref().map(|v| v.len() > 255).unwrap_or(false);
            if too_long(&socks5.username) || too_long(&socks5.password) {
                return Err(SinkholeError::Config("SOCKS5 credentials exceed 255 bytes".into()));
            }
        }
        Ok(())
    }
}

/// Fluent configuration for embedding hosts.
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = Some(max);
        self
    }

    pub fn select_timeout(mut self, secs: u64) -> Self {
        self.config.select_timeout = secs;
        self
    }

    pub fn verify_ip_checksum(mut self, enable: bool) -> Self {
        self.config.verify_ip_checksum = enable;
        self
    }

    pub fn dns_intercept(mut self, enable: bool) -> Self {
        self.config.dns.intercept = enable;
        self
    }

    pub fn block_response(mut self, mode: BlockResponse) -> Self {
        self.config.dns.block_response = mode;
        self
    }

    pub fn filter_dns_flows(mut self, enable: bool) -> Self {
        self.config.dns.filter_flows = enable;
        self
    }

    pub fn tcp_timeouts(mut self, timeouts: TcpTimeouts) -> Self {
        self.config.tcp = timeouts;
        self
    }

    pub fn udp_timeouts(mut self, timeouts: UdpTimeouts) -> Self {
        self.config.udp = timeouts;
        self
    }

    pub fn socks5(mut self, socks5: Socks5Config) -> Self {
        self.config.socks5 = Some(socks5);
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
