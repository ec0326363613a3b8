//! ICMP echo relay
//!
//! Echo requests are sent through an unprivileged ping socket. The kernel
//! rewrites the identifier, so the original one is kept in the session and
//! put back into every reply before it goes to the tun.

use crate::engine::{Context, Readiness};
use crate::error::{is_transient_io, Result};
use crate::packet::{Packet, Transport};
use crate::relay;
use crate::session::{expired, scaled_timeout, token_for, FlowKey, Session, SessionId, SessionTable};
use crate::wire;
use mio::Interest;
use socket2::{SockAddr, Socket};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Largest ICMP message a ping socket hands back.
const ICMP_MAX_MESSAGE: usize = 65535;

#[derive(Debug)]
pub struct IcmpSession {
    pub key: FlowKey,
    pub owner: Option<u32>,
    pub last_active: Instant,
    /// Identifier chosen by the local application.
    pub id: u16,
    pub stopped: bool,
    pub socket: Option<Socket>,
}

impl IcmpSession {
    /// A session without a socket yet.
    pub fn detached(key: FlowKey, owner: Option<u32>) -> Self {
        Self {
            key,
            owner,
            last_active: Instant::now(),
            id: key.sport,
            stopped: false,
            socket: None,
        }
    }

    pub fn timeout(&self, base: u64, sessions: usize, max: usize) -> u64 {
        scaled_timeout(base, sessions, max)
    }
}

/// Forward an echo request, creating the session on first use.
pub(crate) fn handle(
    ctx: &mut Context<'_>,
    table: &mut SessionTable,
    pkt: &Packet<'_>,
    owner: Option<u32>,
) -> Result<()> {
    let Transport::Icmp(hdr) = pkt.transport else {
        return Ok(());
    };
    if !hdr.is_echo_request(pkt.version) {
        warn!("ICMP type {} code {} not supported", hdr.icmp_type, hdr.code);
        return Ok(());
    }

    let key = FlowKey::from_packet(pkt);
    let id = match table.find(&key) {
        Some(id) => id,
        None => open(ctx, table, key, owner)?,
    };
    let Some(Session::Icmp(s)) = table.get_mut(id) else {
        return Ok(());
    };

    let mut message = pkt.transport_bytes().to_vec();
    message[4..6].copy_from_slice(&(!hdr.id).to_be_bytes());
    wire::fix_icmp_checksum(pkt.src, pkt.dst, &mut message);

    debug!(
        "ICMP forward {} > {} type {} id {:x} seq {} data {}",
        pkt.src,
        pkt.dst,
        hdr.icmp_type,
        !hdr.id,
        hdr.seq,
        message.len()
    );
    s.last_active = ctx.now;

    let Some(socket) = s.socket.as_ref() else {
        return Ok(());
    };
    let target = SockAddr::from(SocketAddr::new(pkt.dst, 0));
    match socket.send_to_with_flags(&message, &target, libc::MSG_NOSIGNAL) {
        Ok(_) => {}
        Err(e) if is_transient_io(&e) => debug!("ICMP sendto deferred: {}", e),
        Err(e) => {
            warn!("ICMP sendto error: {}", e);
            s.stopped = true;
        }
    }
    Ok(())
}

fn open(ctx: &mut Context<'_>, table: &mut SessionTable, key: FlowKey, owner: Option<u32>) -> Result<SessionId> {
    info!("ICMP new session from {} to {}", key.src, key.dst);
    let socket = relay::open_icmp(key.version, ctx.collab.protector.as_ref())?;
    ctx.register(&socket, token_for(table.next_id(), false), Interest::READABLE)?;

    let mut session = IcmpSession::detached(key, owner);
    session.last_active = ctx.now;
    session.socket = Some(socket);
    ctx.stats.record_session();
    Ok(table.insert(Session::Icmp(session)))
}

/// Relay replies back to the tun until the socket runs dry.
pub(crate) fn on_ready(ctx: &mut Context<'_>, s: &mut IcmpSession, ready: Readiness) {
    let Some(socket) = s.socket.as_ref() else {
        return;
    };
    s.last_active = ctx.now;

    if ready.error {
        match relay::pending_error(socket) {
            Some(e) => warn!("ICMP socket error: {}", e),
            None => warn!("ICMP socket error"),
        }
        s.stopped = true;
        return;
    }
    if !ready.readable {
        return;
    }

    let mut buf = vec![0u8; ICMP_MAX_MESSAGE];
    loop {
        let n = match (&*socket).read(&mut buf) {
            Ok(0) => {
                warn!("ICMP recv eof");
                s.stopped = true;
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("ICMP recv error: {}", e);
                s.stopped = true;
                return;
            }
        };
        if n < 8 {
            debug!("ICMP reply too short: {} bytes", n);
            continue;
        }

        let message = &mut buf[..n];
        let seen = u16::from_be_bytes([message[4], message[5]]);
        if seen != !s.id {
            debug!("ICMP reply id {:x} differs from {:x}", seen, !s.id);
        }
        message[4..6].copy_from_slice(&s.id.to_be_bytes());
        wire::fix_icmp_checksum(s.key.dst, s.key.src, message);

        debug!(
            "ICMP reply {} > {} type {} code {} bytes {}",
            s.key.dst, s.key.src, message[0], message[1], n
        );
        let packet = wire::build_icmp(s.key.dst, s.key.src, message);
        if ctx.tun.write(&packet).is_err() {
            s.stopped = true;
            return;
        }
    }
}

/// Policy revocation.
pub(crate) fn revoke(s: &mut IcmpSession) {
    s.stopped = true;
}

/// Returns false once the session should be dropped.
pub(crate) fn check(ctx: &mut Context<'_>, s: &mut IcmpSession) -> bool {
    let timeout = s.timeout(ctx.config.icmp_timeout, ctx.counts.total(), ctx.max_sessions);
    let idle = ctx.now.saturating_duration_since(s.last_active);
    if !s.stopped && !expired(idle, timeout) {
        return true;
    }
    info!(
        "ICMP idle {}/{} sec stopped {} from {} to {}",
        idle.as_secs(),
        timeout,
        s.stopped,
        s.key.src,
        s.key.dst
    );
    ctx.close_socket(&mut s.socket);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{IpVersion, IPPROTO_ICMP};
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn detached_session_keeps_identifier() {
        let key = FlowKey {
            version: IpVersion::V4,
            protocol: IPPROTO_ICMP,
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            sport: 0x1234,
            dst: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            dport: 0x1234,
        };
        let s = IcmpSession::detached(key, Some(10001));
        assert_eq!(s.id, 0x1234);
        assert!(!s.stopped);
        assert!(s.socket.is_none());
        assert_eq!(s.timeout(5, 0, 100), 5);
        assert_eq!(s.timeout(5, 100, 100), 0);
    }
}
