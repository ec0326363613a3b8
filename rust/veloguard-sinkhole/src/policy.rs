//! Decisions and observations delegated to the embedding host
//!
//! The engine never decides on its own whether a flow may pass. It asks a
//! [`PolicyEngine`], resolves owners through an [`OwnerResolver`] and
//! reports what it did to an [`Observer`].

use crate::packet::IpVersion;
use crate::protect::{NoProtect, SocketProtector};
use ipnet::IpNet;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};
use veloguard_sock2proc::UidResolver;

/// Everything known about a flow when policy is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowQuery {
    pub version: IpVersion,
    pub protocol: u8,
    pub flags: String,
    pub src: IpAddr,
    pub sport: u16,
    pub dst: IpAddr,
    pub dport: u16,
    pub owner: Option<u32>,
}

/// Where an allowed flow should be sent instead of its destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RedirectTarget {
    #[serde(default)]
    pub address: Option<IpAddr>,
    #[serde(default)]
    pub port: u16,
}

impl RedirectTarget {
    /// Allowed, not redirected.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn to(addr: SocketAddr) -> Self {
        Self {
            address: Some(addr.ip()),
            port: addr.port(),
        }
    }

    /// The redirect address, if both address and port are set.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.address {
            Some(a) if self.port != 0 => Some(SocketAddr::new(a, self.port)),
            _ => None,
        }
    }
}

pub trait PolicyEngine: Send + Sync {
    /// `None` denies the flow.
    fn is_flow_allowed(&self, query: &FlowQuery) -> Option<RedirectTarget>;

    fn is_domain_blocked(&self, name: &str) -> bool;
}

/// Lets everything through.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PolicyEngine for AllowAll {
    fn is_flow_allowed(&self, _query: &FlowQuery) -> Option<RedirectTarget> {
        Some(RedirectTarget::none())
    }

    fn is_domain_blocked(&self, _name: &str) -> bool {
        false
    }
}

pub trait OwnerResolver: Send + Sync {
    fn resolve(&self, version: IpVersion, protocol: u8, addr: IpAddr, port: u16) -> Option<u32>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOwner;

impl OwnerResolver for NoOwner {
    fn resolve(&self, _version: IpVersion, _protocol: u8, _addr: IpAddr, _port: u16) -> Option<u32> {
        None
    }
}

/// Owner lookup through the kernel socket tables.
#[derive(Debug, Default, Clone)]
pub struct ProcNetResolver {
    inner: UidResolver,
}

impl ProcNetResolver {
    pub fn new(inner: UidResolver) -> Self {
        Self { inner }
    }
}

impl OwnerResolver for ProcNetResolver {
    fn resolve(&self, _version: IpVersion, protocol: u8, addr: IpAddr, port: u16) -> Option<u32> {
        self.inner.resolve(protocol, addr, port)
    }
}

/// One packet decision, as reported to the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketLog {
    pub version: IpVersion,
    pub protocol: u8,
    pub flags: String,
    pub src: IpAddr,
    pub sport: u16,
    pub dst: IpAddr,
    pub dport: u16,
    pub data: String,
    pub owner: Option<u32>,
    pub allowed: bool,
}

/// Bytes exchanged by a finished flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    pub version: IpVersion,
    pub protocol: u8,
    pub dst: IpAddr,
    pub dport: u16,
    pub owner: Option<u32>,
    pub sent: u64,
    pub received: u64,
}

pub trait Observer: Send + Sync {
    fn log_packet(&self, _entry: &PacketLog) {}

    fn dns_resolved(&self, _qname: &str, _aname: &str, _addr: IpAddr, _ttl: u32) {}

    fn account_usage(&self, _usage: &Usage) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn log_packet(&self, e: &PacketLog) {
        info!(
            "packet v{} p{} {}/{} > {}/{} flags {} owner {:?} allowed {} {}",
            e.version, e.protocol, e.src, e.sport, e.dst, e.dport, e.flags, e.owner, e.allowed, e.data
        );
    }

    fn dns_resolved(&self, qname: &str, aname: &str, addr: IpAddr, ttl: u32) {
        debug!("dns {} ({}) = {} ttl {}", qname, aname, addr, ttl);
    }

    fn account_usage(&self, u: &Usage) {
        debug!(
            "usage v{} p{} {}/{} owner {:?} sent {} received {}",
            u.version, u.protocol, u.dst, u.dport, u.owner, u.sent, u.received
        );
    }
}

/// Host-provided collaborators, shared with the engine.
#[derive(Clone)]
pub struct Collaborators {
    pub policy: Arc<dyn PolicyEngine>,
    pub owner: Arc<dyn OwnerResolver>,
    pub observer: Arc<dyn Observer>,
    pub protector: Arc<dyn SocketProtector>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            policy: Arc::new(AllowAll),
            owner: Arc::new(NoOwner),
            observer: Arc::new(TracingObserver),
            protector: Arc::new(NoProtect),
        }
    }
}

impl Collaborators {
    pub fn with_policy(mut self, policy: Arc<dyn PolicyEngine>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_owner(mut self, owner: Arc<dyn OwnerResolver>) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_protector(mut self, protector: Arc<dyn SocketProtector>) -> Self {
        self.protector = protector;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl RuleProtocol {
    fn matches(self, protocol: u8) -> bool {
        match self {
            RuleProtocol::Tcp => protocol == crate::packet::IPPROTO_TCP,
            RuleProtocol::Udp => protocol == crate::packet::IPPROTO_UDP,
            RuleProtocol::Icmp => {
                protocol == crate::packet::IPPROTO_ICMP || protocol == crate::packet::IPPROTO_ICMPV6
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RedirectRule {
    #[serde(default)]
    pub protocol: Option<RuleProtocol>,
    pub dport: u16,
    pub target: RedirectTarget,
}

/// Static rule set loaded from configuration.
///
/// Allow lists take precedence over block lists, which take precedence
/// over the default action.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuleSetPolicy {
    pub default_action: Action,
    pub blocked_domains: Vec<String>,
    pub allowed_domains: Vec<String>,
    pub blocked_networks: Vec<IpNet>,
    pub allowed_networks: Vec<IpNet>,
    pub blocked_ports: Vec<u16>,
    pub blocked_owners: Vec<u32>,
    pub redirects: Vec<RedirectRule>,
}

impl RuleSetPolicy {
    fn normalize(name: &str) -> String {
        name.trim_end_matches('.').to_ascii_lowercase()
    }

    fn redirect_for(&self, query: &FlowQuery) -> RedirectTarget {
        self.redirects
            .iter()
            .find(|r| r.dport == query.dport && r.protocol.map(|p| p.matches(query.protocol)).unwrap_or(true))
            .map(|r| r.target)
            .unwrap_or_default()
    }
}

impl PolicyEngine for RuleSetPolicy {
    fn is_flow_allowed(&self, query: &FlowQuery) -> Option<RedirectTarget> {
        if self.allowed_networks.iter().any(|n| n.contains(&query.dst)) {
            return Some(self.redirect_for(query));
        }
        let blocked = self.blocked_networks.iter().any(|n| n.contains(&query.dst))
            || self.blocked_ports.contains(&query.dport)
            || query.owner.map(|o| self.blocked_owners.contains(&o)).unwrap_or(false);
        if blocked || self.default_action == Action::Deny {
            return None;
        }
        Some(self.redirect_for(query))
    }

    fn is_domain_blocked(&self, name: &str) -> bool {
        let name = Self::normalize(name);
        let hit = |list: &[String]| list.iter().any(|s| domain_matches(&name, &Self::normalize(s)));
        !hit(&self.allowed_domains) && hit(&self.blocked_domains)
    }
}

/// Suffix match on a label boundary.
fn domain_matches(name: &str, suffix: &str) -> bool {
    if suffix.is_empty() {
        return false;
    }
    if name == suffix {
        return true;
    }
    let Some(rest) = name.strip_suffix(suffix) else {
        return false;
    };
    rest.ends_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{IPPROTO_TCP, IPPROTO_UDP};

    fn query(dst: &str, dport: u16, protocol: u8, owner: Option<u32>) -> FlowQuery {
        FlowQuery {
            version: IpVersion::V4,
            protocol,
            flags: String::new(),
            src: "10.0.0.2".parse().unwrap(),
            sport: 40000,
            dst: dst.parse().unwrap(),
            dport,
            owner,
        }
    }

    #[test]
    fn domain_matches_requires_suffix_boundary() {
        assert!(domain_matches("example.com", "example.com"));
        assert!(domain_matches("sub.example.com", "example.com"));
        assert!(!domain_matches("notexample.com", "example.com"));
        assert!(!domain_matches("example.com.evil", "example.com"));
        assert!(!domain_matches("anything", ""));
    }

    #[test]
    fn domain_blocking_is_case_insensitive_and_allow_wins() {
        let policy = RuleSetPolicy {
            blocked_domains: vec!["Ads.Example.".into(), "tracker.net".into()],
            allowed_domains: vec!["ok.tracker.net".into()],
            ..Default::default()
        };
        assert!(policy.is_domain_blocked("x.ads.example"));
        assert!(policy.is_domain_blocked("TRACKER.net."));
        assert!(!policy.is_domain_blocked("ok.tracker.net"));
        assert!(!policy.is_domain_blocked("example"));
    }

    #[test]
    fn networks_ports_and_owners() {
        let policy: RuleSetPolicy = serde_yaml::from_str(
            r#"
blocked_networks: ["203.0.113.0/24"]
allowed_networks: ["203.0.113.7/32"]
blocked_ports: [25]
blocked_owners: [1001]
"#,
        )
        .unwrap();
        assert!(policy.is_flow_allowed(&query("203.0.113.9", 443, IPPROTO_TCP, None)).is_none());
        assert!(policy.is_flow_allowed(&query("203.0.113.7", 443, IPPROTO_TCP, None)).is_some());
        assert!(policy.is_flow_allowed(&query("198.51.100.1", 25, IPPROTO_TCP, None)).is_none());
        assert!(policy.is_flow_allowed(&query("198.51.100.1", 443, IPPROTO_TCP, Some(1001))).is_none());
        assert_eq!(
            policy.is_flow_allowed(&query("198.51.100.1", 443, IPPROTO_TCP, Some(1000))),
            Some(RedirectTarget::none())
        );
    }

    #[test]
    fn default_deny_and_redirects() {
        let policy: RuleSetPolicy = serde_yaml::from_str(
            r#"
default_action: deny
allowed_networks: ["0.0.0.0/0"]
redirects:
  - protocol: udp
    dport: 53
    target: { address: "9.9.9.9", port: 53 }
"#,
        )
        .unwrap();
        let dns = policy.is_flow_allowed(&query("8.8.8.8", 53, IPPROTO_UDP, None)).unwrap();
        assert_eq!(dns.socket_addr(), Some("9.9.9.9:53".parse().unwrap()));
        let tcp = policy.is_flow_allowed(&query("8.8.8.8", 53, IPPROTO_TCP, None)).unwrap();
        assert_eq!(tcp.socket_addr(), None);

        let deny = RuleSetPolicy { default_action: Action::Deny, ..Default::default() };
        assert!(deny.is_flow_allowed(&query("8.8.8.8", 53, IPPROTO_UDP, None)).is_none());
    }

    #[test]
    fn redirect_needs_address_and_port() {
        assert_eq!(RedirectTarget::none().socket_addr(), None);
        let half = RedirectTarget { address: Some("1.1.1.1".parse().unwrap()), port: 0 };
        assert_eq!(half.socket_addr(), None);
        let full = RedirectTarget::to("1.1.1.1:853".parse().unwrap());
        assert_eq!(full.socket_addr(), Some("1.1.1.1:853".parse().unwrap()));
    }
}
