//! Session registry
//!
//! Sessions live in a `BTreeMap` keyed by a monotonically increasing id.
//! The id doubles as the poll token of the session's sockets, see
//! [`token_for`].

use crate::icmp::IcmpSession;
use crate::packet::{IpVersion, Packet, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};
use crate::tcp::TcpSession;
use crate::udp::UdpSession;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::debug;

pub type SessionId = usize;

/// Fallback session ceiling when the descriptor limit cannot be read.
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

/// Token reserved for the tun device.
pub const TUN_TOKEN: mio::Token = mio::Token(usize::MAX);
/// Token reserved for the stop/reload waker.
pub const WAKER_TOKEN: mio::Token = mio::Token(usize::MAX - 1);

/// Poll token for a session socket. `control` marks the auxiliary SOCKS5
/// control stream of a UDP session.
pub fn token_for(id: SessionId, control: bool) -> mio::Token {
    mio::Token((id << 1) | control as usize)
}

/// Inverse of [`token_for`].
pub fn split_token(token: mio::Token) -> (SessionId, bool) {
    (token.0 >> 1, token.0 & 1 == 1)
}

/// Five-tuple plus IP version. `src` is the local application side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub version: IpVersion,
    pub protocol: u8,
    pub src: IpAddr,
    pub sport: u16,
    pub dst: IpAddr,
    pub dport: u16,
}

impl FlowKey {
    pub fn from_packet(pkt: &Packet<'_>) -> Self {
        Self {
            version: pkt.version,
            protocol: pkt.protocol,
            src: pkt.src,
            sport: pkt.sport(),
            dst: pkt.dst,
            dport: pkt.dport(),
        }
    }

    pub fn destination(&self) -> SocketAddr {
        SocketAddr::new(self.dst, self.dport)
    }

    pub fn is_icmp(&self) -> bool {
        self.protocol == IPPROTO_ICMP || self.protocol == IPPROTO_ICMPV6
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            IPPROTO_TCP => "TCP",
            IPPROTO_UDP => "UDP",
            IPPROTO_ICMP => "ICMP",
            IPPROTO_ICMPV6 => "ICMPv6",
            _ => "IP",
        };
        write!(
            f,
            "{}{} {}/{} > {}/{}",
            proto, self.version, self.src, self.sport, self.dst, self.dport
        )
    }
}

#[derive(Debug)]
pub enum Session {
    Icmp(IcmpSession),
    Udp(UdpSession),
    Tcp(TcpSession),
}

impl Session {
    pub fn key(&self) -> &FlowKey {
        match self {
            Session::Icmp(s) => &s.key,
            Session::Udp(s) => &s.key,
            Session::Tcp(s) => &s.key,
        }
    }

    pub fn owner(&self) -> Option<u32> {
        match self {
            Session::Icmp(s) => s.owner,
            Session::Udp(s) => s.owner,
            Session::Tcp(s) => s.owner,
        }
    }

    pub fn last_active(&self) -> Instant {
        match self {
            Session::Icmp(s) => s.last_active,
            Session::Udp(s) => s.last_active,
            Session::Tcp(s) => s.last_active,
        }
    }

    /// Counted against the session ceiling.
    pub fn is_active(&self) -> bool {
        match self {
            Session::Icmp(s) => !s.stopped,
            Session::Udp(s) => s.is_active(),
            Session::Tcp(s) => s.is_active(),
        }
    }

    fn matches(&self, key: &FlowKey) -> bool {
        match self {
            // Echo identifiers are rewritten upstream, so only the addresses count.
            Session::Icmp(s) => {
                !s.stopped && s.key.version == key.version && s.key.src == key.src && s.key.dst == key.dst
            }
            Session::Udp(s) => s.key == *key,
            Session::Tcp(s) => s.key == *key,
        }
    }
}

/// Active session counts per protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounts {
    pub icmp: usize,
    pub udp: usize,
    pub tcp: usize,
}

impl SessionCounts {
    pub fn total(&self) -> usize {
        self.icmp + self.udp + self.tcp
    }
}

#[derive(Debug)]
pub struct SessionTable {
    sessions: BTreeMap<SessionId, Session>,
    next_id: SessionId,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn find(&self, key: &FlowKey) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|(_, s)| s.key().protocol == key.protocol && s.matches(key))
            .map(|(id, _)| *id)
    }

    /// Id the next inserted session will receive, so sockets can be
    /// registered before the session exists.
    pub fn next_id(&self) -> SessionId {
        self.next_id
    }

    pub fn insert(&mut self, session: Session) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        debug!("session {} added: {}", id, session.key());
        self.sessions.insert(id, session);
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionId, &Session)> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SessionId, &mut Session)> {
        self.sessions.iter_mut()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&SessionId, &mut Session) -> bool,
    {
        self.sessions.retain(f);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn counts(&self) -> SessionCounts {
        let mut c = SessionCounts::default();
        for s in self.sessions.values().filter(|s| s.is_active()) {
            match s {
                Session::Icmp(_) => c.icmp += 1,
                Session::Udp(_) => c.udp += 1,
                Session::Tcp(_) => c.tcp += 1,
            }
        }
        c
    }

    pub fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active()).count()
    }

    /// Drop every session. Dropping closes the owned sockets.
    pub fn clear(&mut self) -> Vec<Session> {
        std::mem::take(&mut self.sessions).into_values().collect()
    }
}

/// Timeout shrinking linearly to zero as `sessions` approaches `max`.
pub fn scaled_timeout(base: u64, sessions: usize, max: usize) -> u64 {
    if max == 0 {
        return 0;
    }
    let used = (sessions.saturating_mul(100) / max).min(100) as u64;
    base * (100 - used) / 100
}

/// UDP timeout divided by the number of `scale`-sized session blocks.
pub fn udp_timeout(base: u64, sessions: usize, scale: usize) -> u64 {
    let divisor = (sessions / scale.max(1)).max(1) as u64;
    base / divisor
}

/// Timeouts are counted in whole seconds, so a zero timeout still leaves
/// the rest of the current second.
pub fn expired(idle: Duration, timeout: u64) -> bool {
    idle.as_secs() > timeout
}

/// Three quarters of the soft descriptor limit.
pub fn default_max_sessions() -> usize {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the provided struct.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if rc != 0 || rlim.rlim_cur == 0 || rlim.rlim_cur == libc::RLIM_INFINITY {
        return DEFAULT_MAX_SESSIONS;
    }
    let max = (rlim.rlim_cur as usize).saturating_mul(75) / 100;
    if max == 0 { DEFAULT_MAX_SESSIONS } else { max }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icmp::IcmpSession;
    use std::net::Ipv4Addr;

    fn key(protocol: u8, sport: u16) -> FlowKey {
        FlowKey {
            version: IpVersion::V4,
            protocol,
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            sport,
            dst: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            dport: sport,
        }
    }

    #[test]
    fn tokens_round_trip() {
        assert_eq!(split_token(token_for(42, false)), (42, false));
        assert_eq!(split_token(token_for(42, true)), (42, true));
        assert_ne!(token_for(1, true), TUN_TOKEN);
        assert_ne!(token_for(1, true), WAKER_TOKEN);
    }

    #[test]
    fn icmp_lookup_ignores_identifier() {
        let mut table = SessionTable::new();
        let id = table.insert(Session::Icmp(IcmpSession::detached(key(IPPROTO_ICMP, 7), None)));
        assert_eq!(table.find(&key(IPPROTO_ICMP, 99)), Some(id));
        assert_eq!(table.find(&key(IPPROTO_UDP, 7)), None);

        if let Some(Session::Icmp(s)) = table.get_mut(id) {
            s.stopped = true;
        }
        assert_eq!(table.find(&key(IPPROTO_ICMP, 7)), None);
        assert_eq!(table.counts().icmp, 0);
    }

    #[test]
    fn ids_are_monotonic() {
        let mut table = SessionTable::new();
        let a = table.insert(Session::Icmp(IcmpSession::detached(key(IPPROTO_ICMP, 1), None)));
        table.remove(a);
        let b = table.insert(Session::Icmp(IcmpSession::detached(key(IPPROTO_ICMP, 1), None)));
        assert!(b > a);
        assert_eq!(table.len(), 1);
        assert_eq!(table.clear().len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn scaled_timeout_shrinks_with_load() {
        assert_eq!(scaled_timeout(300, 0, 100), 300);
        assert_eq!(scaled_timeout(300, 50, 100), 150);
        assert_eq!(scaled_timeout(300, 100, 100), 0);
        assert_eq!(scaled_timeout(300, 500, 100), 0);
        assert_eq!(scaled_timeout(300, 1, 0), 0);
    }

    #[test]
    fn udp_timeout_divides_by_blocks() {
        assert_eq!(udp_timeout(300, 0, 50), 300);
        assert_eq!(udp_timeout(300, 49, 50), 300);
        assert_eq!(udp_timeout(300, 100, 50), 150);
        assert_eq!(udp_timeout(15, 1000, 50), 0);
    }

    #[test]
    fn zero_timeout_keeps_the_current_second() {
        assert!(!expired(Duration::ZERO, 0));
        assert!(!expired(Duration::from_millis(999), 0));
        assert!(expired(Duration::from_secs(1), 0));
        assert!(!expired(Duration::from_millis(5999), 5));
        assert!(expired(Duration::from_secs(6), 5));
    }

    #[test]
    fn max_sessions_is_positive() {
        assert!(default_max_sessions() > 0);
    }
}
