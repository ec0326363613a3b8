//! UDP relay and DNS interception
//!
//! ```text
//! ACTIVE ──idle/error/dns answer──> FINISHING ──sweep──> CLOSED ──keep──> removed
//! BLOCKED (policy placeholder) ─────────────────────────────────keep──> removed
//! ```
//!
//! Queries for blocked names are answered locally before any socket is
//! opened. Answers that slip through (queries sent before a block took
//! effect) are scrubbed on the way back.

use crate::config::{Socks5Config, UdpTimeouts};
use crate::dns;
use crate::engine::{Context, Readiness};
use crate::error::{is_transient_io, Result, SinkholeError};
use crate::packet::{IpVersion, Packet};
use crate::policy::{Observer, PacketLog, PolicyEngine, Usage};
use crate::relay;
use crate::session::{expired, token_for, udp_timeout, FlowKey, Session, SessionId, SessionTable};
use crate::socks5::{self, Socks5Client, Socks5State};
use crate::wire;
use mio::Interest;
use socket2::{SockAddr, Socket};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Largest datagram read from an upstream socket.
const UDP_MAX_DATAGRAM: usize = 65535;

/// Datagrams held while a UDP association is being set up.
const MAX_PENDING_DATAGRAMS: usize = 64;

const DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpState {
    Active,
    Finishing,
    Closed,
    Blocked,
}

impl fmt::Display for UdpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UdpState::Active => "ACTIVE",
            UdpState::Finishing => "FINISHING",
            UdpState::Closed => "CLOSED",
            UdpState::Blocked => "BLOCKED",
        };
        f.write_str(s)
    }
}

/// UDP ASSOCIATE state of a session relayed through SOCKS5.
#[derive(Debug)]
pub struct UdpRelay {
    /// TCP control stream; the association lives as long as it does.
    pub control: Socket,
    pub client: Socks5Client,
    pub proxy: SocketAddr,
    /// Relay endpoint reported by the proxy.
    pub relay: Option<SocketAddr>,
    /// Framed datagrams waiting for the association.
    pub pending: VecDeque<Vec<u8>>,
}

impl UdpRelay {
    fn new(control: Socket, cfg: &Socks5Config) -> Self {
        let local = match cfg.address {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        Self {
            control,
            client: Socks5Client::udp_associate(local, cfg.credentials()),
            proxy: cfg.address,
            relay: None,
            pending: VecDeque::new(),
        }
    }

    /// Send the next handshake message, if one is due.
    fn advance(&mut self) -> Result<()> {
        if let Some(msg) = self.client.request() {
            self.control.send_with_flags(&msg, libc::MSG_NOSIGNAL)?;
        }
        Ok(())
    }

    fn on_reply(&mut self, reply: &[u8]) -> Result<()> {
        if self.client.is_done() {
            return Ok(());
        }
        match self.client.on_reply(reply)? {
            Socks5State::UdpAssociated => {
                let bound = self
                    .client
                    .bound()
                    .ok_or_else(|| SinkholeError::Socks5("no relay address".into()))?;
                // A wildcard reply means "same host as the proxy".
                let relay = if bound.ip().is_unspecified() {
                    SocketAddr::new(self.proxy.ip(), bound.port())
                } else {
                    bound
                };
                debug!("SOCKS5 UDP relay at {}", relay);
                self.relay = Some(relay);
                Ok(())
            }
            _ => self.advance(),
        }
    }
}

#[derive(Debug)]
pub struct UdpSession {
    pub key: FlowKey,
    pub owner: Option<u32>,
    pub state: UdpState,
    pub last_active: Instant,
    pub socket: Option<Socket>,
    pub redirect: Option<SocketAddr>,
    pub socks5: Option<UdpRelay>,
    pub sent: u64,
    pub received: u64,
}

impl UdpSession {
    fn new(key: FlowKey, owner: Option<u32>, now: Instant) -> Self {
        Self {
            key,
            owner,
            state: UdpState::Active,
            last_active: now,
            socket: None,
            redirect: None,
            socks5: None,
            sent: 0,
            received: 0,
        }
    }

    /// Placeholder for a denied flow.
    pub fn blocked(key: FlowKey, owner: Option<u32>, now: Instant) -> Self {
        Self {
            state: UdpState::Blocked,
            ..Self::new(key, owner, now)
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == UdpState::Active
    }

    pub fn is_dns(&self) -> bool {
        self.key.dport == DNS_PORT
    }

    /// Idle timeout for an ACTIVE session given the number of active UDP sessions.
    pub fn timeout(&self, cfg: &UdpTimeouts, sessions: usize) -> u64 {
        let base = if self.is_dns() { cfg.dns } else { cfg.any };
        udp_timeout(base, sessions, cfg.scale)
    }

    fn finish(&mut self, why: &str) {
        if self.state == UdpState::Active {
            debug!("UDP {} finishing: {}", self.key, why);
            self.state = UdpState::Finishing;
        }
    }
}

/// Answer a query for a blocked name without going upstream.
///
/// Returns true when the datagram was consumed.
fn intercept_query(ctx: &mut Context<'_>, pkt: &Packet<'_>, owner: Option<u32>) -> bool {
    let Some(query) = dns::parse_query(pkt.payload()) else {
        return false;
    };
    ctx.stats.record_dns_query();
    if !query.is_address_lookup() || !ctx.collab.policy.is_domain_blocked(&query.name) {
        return false;
    }

    let cfg = &ctx.config.dns;
    info!("DNS query qtype {} qname {} blocked", query.qtype, query.name);
    ctx.stats.record_dns_blocked();
    ctx.collab.observer.log_packet(&PacketLog {
        version: pkt.version,
        protocol: pkt.protocol,
        flags: String::new(),
        src: pkt.src,
        sport: pkt.sport(),
        dst: pkt.dst,
        dport: pkt.dport(),
        data: format!("qtype {} qname {}", query.qtype, query.name),
        owner,
        allowed: false,
    });

    let answer = dns::build_blocked_response(pkt.payload(), &query, cfg.block_response, cfg.ttl);
    let reply = wire::build_udp(pkt.dst, pkt.src, pkt.dport(), pkt.sport(), &answer);
    if let Err(e) = ctx.tun.write(&reply) {
        debug!("blocked DNS answer not delivered: {}", e);
    }
    true
}

/// Forward a datagram from the tun.
pub(crate) fn handle(
    ctx: &mut Context<'_>,
    table: &mut SessionTable,
    pkt: &Packet<'_>,
    owner: Option<u32>,
    redirect: Option<SocketAddr>,
) -> Result<()> {
    let key = FlowKey::from_packet(pkt);
    let existing = table.find(&key);
    if let Some(Session::Udp(s)) = existing.and_then(|id| table.get(id)) {
        if !s.is_active() {
            debug!("UDP {} {} dropped", key, s.state);
            return Ok(());
        }
    }

    if ctx.config.dns.intercept && key.dport == DNS_PORT && intercept_query(ctx, pkt, owner) {
        if let Some(Session::Udp(s)) = existing.and_then(|id| table.get_mut(id)) {
            s.finish("blocked query");
        }
        return Ok(());
    }

    let id = match existing {
        Some(id) => id,
        None => open(ctx, table, key, owner, redirect)?,
    };
    let Some(Session::Udp(s)) = table.get_mut(id) else {
        return Ok(());
    };

    let payload = pkt.payload();
    s.last_active = ctx.now;
    s.sent += payload.len() as u64;
    if let Err(e) = send(s, payload) {
        if e.is_transient() {
            debug!("UDP {} send deferred: {}", s.key, e);
        } else {
            warn!("UDP {} send error: {}", s.key, e);
            s.finish("send error");
        }
    }
    Ok(())
}

fn open(
    ctx: &mut Context<'_>,
    table: &mut SessionTable,
    key: FlowKey,
    owner: Option<u32>,
    redirect: Option<SocketAddr>,
) -> Result<SessionId> {
    let id = table.next_id();
    let protector = ctx.collab.protector.as_ref();
    let proxy = match (&ctx.config.socks5, redirect) {
        (Some(cfg), None) if cfg.udp => Some(cfg),
        _ => None,
    };
    let target = redirect
        .or(proxy.map(|cfg| cfg.address))
        .unwrap_or_else(|| key.destination());

    let socket = relay::open_udp(IpVersion::of(&target.ip()), target.ip(), protector)?;
    ctx.register(&socket, token_for(id, false), Interest::READABLE)?;

    let socks5 = match proxy {
        Some(cfg) => {
            let control = relay::open_tcp(cfg.address, protector)?;
            ctx.register(&control, token_for(id, true), Interest::READABLE | Interest::WRITABLE)?;
            Some(UdpRelay::new(control, cfg))
        }
        None => None,
    };

    info!("UDP new session {} via {}", key, target);
    let mut session = UdpSession::new(key, owner, ctx.now);
    session.socket = Some(socket);
    session.redirect = redirect;
    session.socks5 = socks5;
    ctx.stats.record_session();
    Ok(table.insert(Session::Udp(session)))
}

fn send(s: &mut UdpSession, payload: &[u8]) -> Result<()> {
    let Some(socket) = s.socket.as_ref() else {
        return Ok(());
    };
    let dst = s.key.destination();
    match s.socks5.as_mut() {
        Some(r) => {
            let framed = socks5::encode_udp_datagram(dst, payload);
            match r.relay {
                Some(addr) => {
                    socket.send_to_with_flags(&framed, &SockAddr::from(addr), libc::MSG_NOSIGNAL)?;
                }
                None if r.pending.len() < MAX_PENDING_DATAGRAMS => r.pending.push_back(framed),
                None => debug!("UDP {} association pending, datagram dropped", s.key),
            }
        }
        None => {
            let to = SockAddr::from(s.redirect.unwrap_or(dst));
            socket.send_to_with_flags(payload, &to, libc::MSG_NOSIGNAL)?;
        }
    }
    Ok(())
}

/// Report resolved addresses and scrub answers for blocked names.
///
/// Returns the datagram to deliver and whether it was scrubbed.
pub(crate) fn inspect_response<'a>(
    policy: &dyn PolicyEngine,
    observer: &dyn Observer,
    rcode: u8,
    data: &'a [u8],
) -> (Cow<'a, [u8]>, bool) {
    let Some((qname, _)) = dns::response_question(data) else {
        return (Cow::Borrowed(data), false);
    };
    // The question decides; answer records may be malformed.
    if policy.is_domain_blocked(&qname) {
        if let Some(scrubbed) = dns::scrub_response(data, rcode) {
            warn!("DNS answer for blocked {} scrubbed", qname);
            return (Cow::Owned(scrubbed), true);
        }
    }
    if let Some(response) = dns::parse_response(data) {
        for answer in &response.answers {
            observer.dns_resolved(&response.qname, &answer.name, answer.addr, answer.ttl);
        }
    }
    (Cow::Borrowed(data), false)
}

/// Socket readiness for the data socket or, with `control`, the SOCKS5 stream.
pub(crate) fn on_ready(ctx: &mut Context<'_>, s: &mut UdpSession, ready: Readiness, control: bool) {
    if s.state != UdpState::Active {
        return;
    }
    if control {
        if let Err(e) = on_control_ready(s, ready) {
            ctx.stats.record_socks5_error();
            warn!("UDP {} SOCKS5 relay failed: {}", s.key, e);
            s.finish("relay failed");
        }
        return;
    }

    let Some(socket) = s.socket.as_ref() else {
        return;
    };
    s.last_active = ctx.now;
    if ready.error {
        match relay::pending_error(socket) {
            Some(e) => warn!("UDP {} SO_ERROR {}", s.key, e),
            None => warn!("UDP {} socket error", s.key),
        }
        s.finish("socket error");
        return;
    }
    if !ready.readable {
        return;
    }

    let mut buf = vec![0u8; UDP_MAX_DATAGRAM];
    while s.state == UdpState::Active {
        let Some(socket) = s.socket.as_ref() else {
            return;
        };
        let n = match (&*socket).read(&mut buf) {
            Ok(0) => {
                s.finish("recv eof");
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("UDP {} recv error: {}", s.key, e);
                s.finish("recv error");
                return;
            }
        };

        let datagram = match s.socks5 {
            Some(_) => match socks5::decode_udp_datagram(&buf[..n]) {
                Ok((_, payload)) => payload,
                Err(e) => {
                    debug!("UDP {} bad relay datagram: {}", s.key, e);
                    continue;
                }
            },
            None => &buf[..n],
        };
        deliver(ctx, s, datagram);
    }
}

fn deliver(ctx: &mut Context<'_>, s: &mut UdpSession, datagram: &[u8]) {
    s.received += datagram.len() as u64;
    let data = if s.is_dns() {
        let rcode = ctx.config.dns.block_response.rcode();
        let (data, scrubbed) = inspect_response(
            ctx.collab.policy.as_ref(),
            ctx.collab.observer.as_ref(),
            rcode,
            datagram,
        );
        if scrubbed {
            ctx.stats.record_dns_scrubbed();
        }
        data
    } else {
        Cow::Borrowed(datagram)
    };

    debug!("UDP {} recv {} bytes", s.key, data.len());
    let reply = wire::build_udp(s.key.dst, s.key.src, s.key.dport, s.key.sport, &data);
    if ctx.tun.write(&reply).is_err() {
        s.finish("tun write failed");
        return;
    }
    if s.is_dns() {
        s.finish("dns answered");
    }
}

fn on_control_ready(s: &mut UdpSession, ready: Readiness) -> Result<()> {
    let Some(r) = s.socks5.as_mut() else {
        return Ok(());
    };
    if ready.error {
        let e = relay::pending_error(&r.control)
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "control socket error"));
        return Err(e.into());
    }
    if ready.writable {
        r.advance()?;
    }
    if !ready.readable {
        return Ok(());
    }

    let mut buf = [0u8; 512];
    loop {
        match (&r.control).read(&mut buf) {
            Ok(0) => return Err(SinkholeError::Socks5("control stream closed".into())),
            Ok(n) => r.on_reply(&buf[..n])?,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    if let (Some(addr), Some(socket)) = (r.relay, s.socket.as_ref()) {
        let to = SockAddr::from(addr);
        while let Some(framed) = r.pending.pop_front() {
            match socket.send_to_with_flags(&framed, &to, libc::MSG_NOSIGNAL) {
                Ok(_) => {}
                Err(e) if is_transient_io(&e) => {
                    r.pending.push_front(framed);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

/// Create the BLOCKED placeholder for a denied flow.
pub(crate) fn block(ctx: &mut Context<'_>, table: &mut SessionTable, pkt: &Packet<'_>, owner: Option<u32>) {
    let key = FlowKey::from_packet(pkt);
    if table.find(&key).is_some() {
        return;
    }
    info!("UDP {} blocked", key);
    table.insert(Session::Udp(UdpSession::blocked(key, owner, ctx.now)));
}

/// Policy revocation. Returns false when the session should go.
pub(crate) fn revoke(s: &mut UdpSession) -> bool {
    match s.state {
        UdpState::Active => {
            s.finish("revoked");
            true
        }
        UdpState::Blocked => false,
        _ => true,
    }
}

fn close(ctx: &Context<'_>, s: &mut UdpSession) {
    ctx.close_socket(&mut s.socket);
    if let Some(r) = s.socks5.take() {
        ctx.deregister(&r.control);
    }
}

fn account(ctx: &Context<'_>, s: &mut UdpSession) {
    if s.sent == 0 && s.received == 0 {
        return;
    }
    ctx.collab.observer.account_usage(&Usage {
        version: s.key.version,
        protocol: s.key.protocol,
        dst: s.key.dst,
        dport: s.key.dport,
        owner: s.owner,
        sent: s.sent,
        received: s.received,
    });
    s.sent = 0;
    s.received = 0;
}

/// Sweep step. Returns false once the session should be dropped.
pub(crate) fn check(ctx: &mut Context<'_>, s: &mut UdpSession) -> bool {
    let idle = ctx.now.saturating_duration_since(s.last_active);
    if s.state == UdpState::Active {
        let timeout = s.timeout(&ctx.config.udp, ctx.counts.udp);
        if expired(idle, timeout) {
            info!("UDP {} idle {}/{} sec", s.key, idle.as_secs(), timeout);
            s.state = UdpState::Finishing;
        }
    }

    if s.state == UdpState::Finishing {
        info!("UDP {} close", s.key);
        close(ctx, s);
        account(ctx, s);
        s.last_active = ctx.now;
        s.state = UdpState::Closed;
    }

    let idle = ctx.now.saturating_duration_since(s.last_active);
    let lingering = matches!(s.state, UdpState::Closed | UdpState::Blocked);
    !(lingering && expired(idle, ctx.config.udp.keep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tests::{query, response};
    use crate::dns::{DNS_QTYPE_A, DNS_RCODE_NXDOMAIN};
    use crate::packet::IPPROTO_UDP;
    use crate::policy::RuleSetPolicy;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        resolved: Mutex<Vec<(String, IpAddr)>>,
    }

    impl Observer for Recorder {
        fn dns_resolved(&self, qname: &str, _aname: &str, addr: IpAddr, _ttl: u32) {
            self.resolved.lock().push((qname.to_string(), addr));
        }
    }

    fn key(dport: u16) -> FlowKey {
        FlowKey {
            version: IpVersion::V4,
            protocol: IPPROTO_UDP,
            src: "10.0.0.2".parse().unwrap(),
            sport: 40000,
            dst: "8.8.8.8".parse().unwrap(),
            dport,
        }
    }

    fn policy() -> RuleSetPolicy {
        RuleSetPolicy {
            blocked_domains: vec!["ads.example".into()],
            ..Default::default()
        }
    }

    #[test]
    fn dns_sessions_time_out_sooner() {
        let cfg = UdpTimeouts::default();
        let now = Instant::now();
        let dns = UdpSession::new(key(53), None, now);
        let other = UdpSession::new(key(443), None, now);
        assert_eq!(dns.timeout(&cfg, 1), 15);
        assert_eq!(other.timeout(&cfg, 1), 300);
        assert_eq!(other.timeout(&cfg, 150), 100);
    }

    #[test]
    fn blocked_placeholder_is_not_active() {
        let mut s = UdpSession::blocked(key(443), Some(10010), Instant::now());
        assert!(!s.is_active());
        s.finish("ignored");
        assert_eq!(s.state, UdpState::Blocked);
        assert!(!revoke(&mut s));
    }

    #[test]
    fn revoke_finishes_active_sessions() {
        let mut s = UdpSession::new(key(443), None, Instant::now());
        assert!(revoke(&mut s));
        assert_eq!(s.state, UdpState::Finishing);
    }

    #[test]
    fn allowed_answers_are_reported_and_passed() {
        let observer = Recorder::default();
        let data = response(7, "cdn.example", &[Ipv4Addr::new(192, 0, 2, 1)]);
        let (out, scrubbed) = inspect_response(&policy(), &observer, DNS_RCODE_NXDOMAIN, &data);
        assert!(!scrubbed);
        assert_eq!(&*out, &data[..]);
        let resolved = observer.resolved.lock();
        assert_eq!(resolved.as_slice(), &[("cdn.example".to_string(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))]);
    }

    #[test]
    fn answers_for_blocked_names_are_scrubbed() {
        let observer = Recorder::default();
        let data = response(7, "x.ads.example", &[Ipv4Addr::new(192, 0, 2, 1)]);
        let (out, scrubbed) = inspect_response(&policy(), &observer, DNS_RCODE_NXDOMAIN, &data);
        assert!(scrubbed);
        assert_eq!(out.len(), query(7, "x.ads.example", DNS_QTYPE_A).len());
        assert_eq!(out[3] & 0x0F, DNS_RCODE_NXDOMAIN);
        assert_eq!(&out[6..8], &[0, 0]);
        assert!(observer.resolved.lock().is_empty());
    }

    #[test]
    fn broken_trailing_answer_still_scrubbed_when_blocked() {
        let observer = Recorder::default();
        let full = response(9, "x.ads.example", &[Ipv4Addr::new(192, 0, 2, 1), Ipv4Addr::new(192, 0, 2, 2)]);
        let data = &full[..full.len() - 2];
        let (out, scrubbed) = inspect_response(&policy(), &observer, DNS_RCODE_NXDOMAIN, data);
        assert!(scrubbed);
        assert_eq!(out.len(), query(9, "x.ads.example", DNS_QTYPE_A).len());
        assert_eq!(out[3] & 0x0F, DNS_RCODE_NXDOMAIN);
        assert_eq!(&out[6..8], &[0, 0]);
    }

    #[test]
    fn answers_before_a_broken_one_are_reported() {
        let observer = Recorder::default();
        let full = response(9, "cdn.example", &[Ipv4Addr::new(192, 0, 2, 1), Ipv4Addr::new(192, 0, 2, 2)]);
        let data = &full[..full.len() - 2];
        let (out, scrubbed) = inspect_response(&policy(), &observer, DNS_RCODE_NXDOMAIN, data);
        assert!(!scrubbed);
        assert_eq!(&*out, data);
        let resolved = observer.resolved.lock();
        assert_eq!(resolved.as_slice(), &[("cdn.example".to_string(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))]);
    }

    #[test]
    fn relay_uses_proxy_host_for_wildcard_bind() {
        let cfg = Socks5Config {
            address: "127.0.0.1:1080".parse().unwrap(),
            username: None,
            password: None,
            udp: true,
        };
        let control = relay::open_udp(IpVersion::V4, "127.0.0.1".parse().unwrap(), &crate::protect::NoProtect).unwrap();
        let mut r = UdpRelay::new(control, &cfg);
        assert_eq!(r.client.request().unwrap(), vec![5, 1, 0]);
        r.client.on_reply(&[5, 0]).unwrap();
        r.client.request().unwrap();
        r.on_reply(&[5, 0, 0, 1, 0, 0, 0, 0, 0x13, 0x88]).unwrap();
        assert_eq!(r.relay, Some("127.0.0.1:5000".parse().unwrap()));
    }
}
