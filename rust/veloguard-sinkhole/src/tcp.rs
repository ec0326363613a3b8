//! TCP proxy state machine
//!
//! The local application talks TCP to the engine through the tun; the
//! engine talks to the remote through an ordinary stream socket. Sequence
//! numbers on the tun side are tracked per session:
//!
//! ```text
//!   local app ──seq/remote_seq──> engine ──send()──> remote
//!   local app <──local_seq/acked── engine <──recv()── remote
//! ```
//!
//! States follow the server half of RFC 793 as seen from the tun:
//! LISTEN (connecting upstream) → SYN_RECV → ESTABLISHED, then either
//! FIN_WAIT1 (remote closed first) or CLOSE_WAIT → LAST_ACK (local app
//! closed first), and finally CLOSING → CLOSE.

use crate::config::TcpTimeouts;
use crate::engine::{Context, Readiness};
use crate::error::{Result, SinkholeError};
use crate::packet::{IpVersion, Packet, TcpFlags, TcpHeader, TcpOptions, MAX_WINDOW_SCALE, TCP_HEADER_LEN};
use crate::policy::Usage;
use crate::relay;
use crate::session::{expired, scaled_timeout, token_for, FlowKey, Session, SessionTable};
use crate::socks5::Socks5Client;
use crate::wire::{self, TcpSegment};
use mio::Interest;
use socket2::Socket;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Socket reads per service pass before yielding to other sessions.
const TCP_READ_BUDGET: usize = 32;

/// Signed distance between two sequence numbers.
pub fn compare_u32(a: u32, b: u32) -> Ordering {
    (a.wrapping_sub(b) as i32).cmp(&0)
}

/// MSS advertised on the tun: what fits in one MTU-sized packet.
pub fn default_mss(mtu: usize, version: IpVersion) -> u16 {
    mtu.saturating_sub(version.header_len() + TCP_HEADER_LEN).min(u16::MAX as usize) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynRecv,
    Established,
    FinWait1,
    CloseWait,
    LastAck,
    Closing,
    Close,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TcpState::Listen => "LISTEN",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Closing => "CLOSING",
            TcpState::Close => "CLOSE",
        };
        f.write_str(s)
    }
}

/// Data from the local application not yet written upstream.
#[derive(Debug, Clone)]
pub struct Segment {
    pub seq: u32,
    pub len: usize,
    /// Bytes of this segment already written.
    pub sent: usize,
    pub psh: bool,
    pub data: Vec<u8>,
}

impl Segment {
    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.len as u32)
    }
}

/// Result of one drain of the forward queue.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    pub forwarded: usize,
    pub error: Option<io::Error>,
}

/// Out-of-order queue ordered by sequence number.
#[derive(Debug, Default)]
pub struct ForwardQueue {
    segments: VecDeque<Segment>,
}

impl ForwardQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Bytes queued and not yet written.
    pub fn pending_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.len - s.sent).sum()
    }

    pub fn front(&self) -> Option<&Segment> {
        self.segments.front()
    }

    /// Queue `data` at `seq`. Returns false when it was dropped.
    pub fn insert(&mut self, remote_seq: u32, seq: u32, data: &[u8], psh: bool) -> bool {
        if compare_u32(seq, remote_seq) == Ordering::Less {
            debug!("already forwarded {}..{}", seq, seq.wrapping_add(data.len() as u32));
            return false;
        }
        let pos = self
            .segments
            .iter()
            .position(|s| compare_u32(s.seq, seq) != Ordering::Less)
            .unwrap_or(self.segments.len());

        match self.segments.get_mut(pos) {
            Some(s) if s.seq == seq => match s.len.cmp(&data.len()) {
                Ordering::Equal => {
                    debug!("segment {} already queued", seq);
                    false
                }
                Ordering::Less => {
                    debug!("segment {} grew {} > {}", seq, s.len, data.len());
                    s.data = data.to_vec();
                    s.len = data.len();
                    s.psh |= psh;
                    true
                }
                Ordering::Greater => {
                    error!("segment {} shrank {} < {}", seq, data.len(), s.len);
                    false
                }
            },
            _ => {
                self.segments.insert(
                    pos,
                    Segment {
                        seq,
                        len: data.len(),
                        sent: 0,
                        psh,
                        data: data.to_vec(),
                    },
                );
                true
            }
        }
    }

    /// Write in-order data through `send` while it fits in `budget`.
    ///
    /// `send` gets the bytes and whether more are expected (no PSH).
    /// `remote_seq` advances by whatever was written.
    pub fn drain<F>(&mut self, remote_seq: &mut u32, mut budget: usize, mut send: F) -> DrainOutcome
    where
        F: FnMut(&[u8], bool) -> io::Result<usize>,
    {
        let mut outcome = DrainOutcome::default();
        while let Some(front) = self.segments.front_mut() {
            // Covered by data forwarded earlier.
            if compare_u32(front.end(), *remote_seq) != Ordering::Greater {
                self.segments.pop_front();
                continue;
            }
            if compare_u32(front.seq, *remote_seq) == Ordering::Less {
                front.sent = front.sent.max(remote_seq.wrapping_sub(front.seq) as usize);
            }
            if front.seq.wrapping_add(front.sent as u32) != *remote_seq {
                break;
            }
            let rest = &front.data[front.sent..];
            if rest.len() > budget {
                break;
            }
            match send(rest, !front.psh) {
                Ok(n) => {
                    outcome.forwarded += n;
                    budget -= n.min(budget);
                    front.sent += n;
                    *remote_seq = front.seq.wrapping_add(front.sent as u32);
                    if front.sent < front.len {
                        debug!("partial send {}/{}", front.sent, front.len);
                        break;
                    }
                    self.segments.pop_front();
                }
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        outcome
    }
}

#[derive(Debug)]
pub struct TcpSession {
    pub key: FlowKey,
    pub owner: Option<u32>,
    pub state: TcpState,
    pub last_active: Instant,
    /// MSS offered by the local application.
    pub mss: u16,
    pub recv_scale: u8,
    pub send_scale: u8,
    /// Window offered by the local application, scaled.
    pub send_window: u32,
    /// Window offered to the local application, scaled.
    pub recv_window: u32,
    /// Next byte expected from the local application.
    pub remote_seq: u32,
    /// Next byte sent to the local application.
    pub local_seq: u32,
    pub remote_start: u32,
    pub local_start: u32,
    /// Highest sequence acknowledged by the local application.
    pub acked: u32,
    /// Set while a keep-alive probe is outstanding.
    pub keep_alive: Option<Instant>,
    pub sent: u64,
    pub received: u64,
    pub forward: ForwardQueue,
    pub socket: Option<Socket>,
    pub readable: bool,
    pub writable: bool,
    pub socks5: Option<Socks5Client>,
}

impl fmt::Display for TcpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} loc {} rem {}",
            self.key,
            self.state,
            self.local_seq.wrapping_sub(self.local_start),
            self.remote_seq.wrapping_sub(self.remote_start)
        )
    }
}

impl TcpSession {
    /// Session for a SYN from the local application, before any socket exists.
    pub fn from_syn(key: FlowKey, owner: Option<u32>, hdr: &TcpHeader, mss: u16, now: Instant) -> Self {
        let ws = hdr.options.window_scale.unwrap_or(0).min(MAX_WINDOW_SCALE);
        let local_start: u32 = rand::random();
        Self {
            key,
            owner,
            state: TcpState::Listen,
            last_active: now,
            mss: hdr.options.mss.unwrap_or(mss),
            recv_scale: ws,
            send_scale: ws,
            send_window: (hdr.window as u32) << ws,
            recv_window: 0,
            remote_seq: hdr.seq,
            local_seq: local_start,
            remote_start: hdr.seq,
            local_start,
            acked: 0,
            keep_alive: None,
            sent: 0,
            received: 0,
            forward: ForwardQueue::new(),
            socket: None,
            readable: false,
            writable: false,
            socks5: None,
        }
    }

    /// Counted against the session ceiling.
    pub fn is_active(&self) -> bool {
        !matches!(self.state, TcpState::Closing | TcpState::Close)
    }

    pub fn timeout(&self, cfg: &TcpTimeouts, sessions: usize, max: usize) -> u64 {
        let base = match self.state {
            TcpState::Listen | TcpState::SynRecv => cfg.init,
            TcpState::Established if self.keep_alive.is_some() => cfg.idle / 2,
            TcpState::Established => cfg.idle,
            _ => cfg.close,
        };
        scaled_timeout(base, sessions, max)
    }

    /// How much more may be sent to the local application.
    pub fn send_window_available(&self) -> u32 {
        if compare_u32(self.acked, self.local_seq) == Ordering::Greater {
            return 0;
        }
        let behind = self.local_seq.wrapping_sub(self.acked);
        self.send_window.saturating_sub(behind)
    }

    /// Window to offer the local application.
    pub fn receive_window(&self) -> u32 {
        let free = self.socket.as_ref().map(relay::send_buffer_free).unwrap_or(0) as u64;
        let max = 0xFFFFu64 << self.recv_scale;
        let window = free.min(max).saturating_sub(self.forward.pending_bytes() as u64);
        if window >> self.recv_scale == 0 {
            0
        } else {
            window as u32
        }
    }

    /// Socket data is waiting that the send window did not let through yet.
    pub fn backlogged(&self) -> bool {
        self.readable
            && self.socket.is_some()
            && matches!(self.state, TcpState::Established | TcpState::CloseWait)
            && self.send_window_available() > 0
    }
}

/// Dispatch a segment from the tun.
pub(crate) fn handle(
    ctx: &mut Context<'_>,
    table: &mut SessionTable,
    pkt: &Packet<'_>,
    owner: Option<u32>,
    redirect: Option<SocketAddr>,
) -> Result<()> {
    let Some(hdr) = pkt.tcp().copied() else {
        return Ok(());
    };
    let key = FlowKey::from_packet(pkt);
    debug!(
        "TCP {} {}/{} > {}/{} seq {} ack {} data {} win {}",
        hdr.flags,
        pkt.src,
        hdr.sport,
        pkt.dst,
        hdr.dport,
        hdr.seq,
        hdr.ack,
        pkt.payload().len(),
        hdr.window
    );

    match table.find(&key) {
        Some(id) => {
            if let Some(Session::Tcp(s)) = table.get_mut(id) {
                on_segment(ctx, s, pkt, &hdr);
                service(ctx, s);
            }
            Ok(())
        }
        None if hdr.flags.syn && !hdr.flags.ack => open(ctx, table, key, pkt, &hdr, owner, redirect),
        None => {
            reset_unknown(ctx, pkt, &hdr);
            Ok(())
        }
    }
}

fn open(
    ctx: &mut Context<'_>,
    table: &mut SessionTable,
    key: FlowKey,
    pkt: &Packet<'_>,
    hdr: &TcpHeader,
    owner: Option<u32>,
    redirect: Option<SocketAddr>,
) -> Result<()> {
    let mss = default_mss(ctx.config.mtu, key.version);
    let mut s = TcpSession::from_syn(key, owner, hdr, mss, ctx.now);
    info!(
        "{} new session mss {} ws {} window {}",
        key, s.mss, s.send_scale, s.send_window
    );

    let data = pkt.payload();
    if !data.is_empty() {
        warn!("{} SYN data {}", key, data.len());
        s.forward.insert(s.remote_seq, hdr.seq.wrapping_add(1), data, hdr.flags.psh);
    }

    let plan = relay::plan_connect(key.destination(), redirect, ctx.config.socks5.as_ref());
    let socket = relay::open_tcp(plan.addr, ctx.collab.protector.as_ref())?;
    ctx.register(
        &socket,
        token_for(table.next_id(), false),
        Interest::READABLE | Interest::WRITABLE,
    )?;
    s.socket = Some(socket);
    s.socks5 = plan.socks5;
    s.recv_window = s.receive_window();

    ctx.stats.record_session();
    table.insert(Session::Tcp(s));
    Ok(())
}

/// Answer a segment for a flow we know nothing about.
fn reset_unknown(ctx: &mut Context<'_>, pkt: &Packet<'_>, hdr: &TcpHeader) {
    if hdr.flags.rst {
        debug!("TCP {}/{} > {}/{} RST for unknown session", pkt.src, hdr.sport, pkt.dst, hdr.dport);
        return;
    }
    warn!("TCP {}/{} > {}/{} unknown session", pkt.src, hdr.sport, pkt.dst, hdr.dport);
    let consumed = pkt.payload().len() as u32 + hdr.flags.fin as u32;
    let seg = TcpSegment {
        sport: hdr.dport,
        dport: hdr.sport,
        seq: hdr.ack,
        ack: hdr.seq.wrapping_add(consumed),
        flags: TcpFlags::rst_only(),
        window: 0,
        options: TcpOptions::default(),
        payload: &[],
    };
    let packet = wire::build_tcp(pkt.dst, pkt.src, &seg);
    if ctx.tun.write(&packet).is_ok() {
        ctx.stats.record_reset();
    }
}

/// Segment for an existing session. The order of the checks matters.
fn on_segment(ctx: &mut Context<'_>, s: &mut TcpSession, pkt: &Packet<'_>, hdr: &TcpHeader) {
    if !s.is_active() {
        warn!("{} was closed", s);
        write_rst(ctx, s);
        return;
    }

    let old = (s.state, s.local_seq, s.remote_seq);
    s.last_active = ctx.now;
    s.send_window = (hdr.window as u32) << s.send_scale;

    let data = pkt.payload();
    if !data.is_empty() {
        if s.socket.is_none() {
            error!("{} data while local closed", s);
            write_rst(ctx, s);
            return;
        }
        if s.state == TcpState::CloseWait {
            error!("{} data while remote closed", s);
            write_rst(ctx, s);
            return;
        }
        s.forward.insert(s.remote_seq, hdr.seq, data, hdr.flags.psh);
    }

    if hdr.flags.rst {
        // No sequence check, RFC 1122 4.2.2.12
        warn!("{} received reset", s);
        s.state = TcpState::Closing;
        return;
    }

    if !hdr.flags.ack || hdr.ack == s.local_seq {
        if hdr.flags.syn {
            warn!("{} repeated SYN", s);
        } else if hdr.flags.fin {
            match s.state {
                TcpState::Established => {
                    info!("{} FIN received", s);
                    if s.forward.is_empty() {
                        s.remote_seq = s.remote_seq.wrapping_add(1);
                        if write_ack(ctx, s).is_ok() {
                            s.state = TcpState::CloseWait;
                        }
                    } else {
                        s.state = TcpState::CloseWait;
                    }
                }
                TcpState::CloseWait => warn!("{} repeated FIN", s),
                TcpState::FinWait1 => {
                    info!("{} last ACK", s);
                    s.remote_seq = s.remote_seq.wrapping_add(1);
                    if write_ack(ctx, s).is_ok() {
                        s.state = TcpState::Close;
                    }
                }
                _ => {
                    error!("{} invalid FIN", s);
                    return;
                }
            }
        } else if hdr.flags.ack {
            s.acked = hdr.ack;
            match s.state {
                TcpState::SynRecv => s.state = TcpState::Established,
                TcpState::LastAck => s.state = TcpState::Closing,
                _ => {}
            }
        } else {
            error!("{} unknown packet", s);
            return;
        }
    } else if hdr.ack.wrapping_add(1) == s.local_seq {
        if s.state == TcpState::Established {
            enable_keep_alive(s);
            s.keep_alive = Some(ctx.now);
        } else {
            debug!("{} keep alive", s);
        }
    } else if compare_u32(hdr.ack, s.local_seq) == Ordering::Less {
        if compare_u32(hdr.ack, s.acked) != Ordering::Greater {
            debug!("{} repeated ACK {}", s, hdr.ack.wrapping_sub(s.local_start));
        } else {
            debug!("{} previous ACK {}", s, hdr.ack.wrapping_sub(s.local_seq) as i32);
            s.acked = hdr.ack;
        }
        return;
    } else {
        error!("{} future ACK", s);
        write_rst(ctx, s);
        return;
    }

    if old != (s.state, s.local_seq, s.remote_seq) {
        debug!("{} handled, was {}", s, old.0);
    }
}

fn enable_keep_alive(s: &TcpSession) {
    let Some(socket) = s.socket.as_ref() else {
        return;
    };
    match socket.set_keepalive(true) {
        Ok(()) => info!("{} enabled keep alive", s),
        Err(e) => warn!("{} SO_KEEPALIVE: {}", s, e),
    }
}

/// Record socket readiness and service the session.
pub(crate) fn on_ready(ctx: &mut Context<'_>, s: &mut TcpSession, ready: Readiness) {
    if s.socket.is_none() {
        return;
    }
    if ready.error {
        s.last_active = ctx.now;
        match s.socket.as_ref().and_then(relay::pending_error) {
            Some(e) => error!("{} SO_ERROR {}", s, e),
            None => error!("{} socket error", s),
        }
        write_rst(ctx, s);
        return;
    }
    s.readable |= ready.readable;
    s.writable |= ready.writable;
    service(ctx, s);
}

/// Move whatever the readiness flags allow in both directions.
pub(crate) fn service(ctx: &mut Context<'_>, s: &mut TcpSession) {
    if s.socket.is_none() {
        return;
    }
    let old = (s.state, s.local_seq, s.remote_seq);
    match s.state {
        TcpState::Listen => connect_step(ctx, s),
        TcpState::Closing | TcpState::Close => {}
        _ => {
            forward_step(ctx, s);
            read_step(ctx, s);
        }
    }
    if old != (s.state, s.local_seq, s.remote_seq) {
        debug!("{} new state, was {}", s, old.0);
    }
}

fn connect_step(ctx: &mut Context<'_>, s: &mut TcpSession) {
    if !s.writable {
        return;
    }
    if let Some(e) = s.socket.as_ref().and_then(relay::pending_error) {
        error!("{} connect error {}", s, e);
        write_rst(ctx, s);
        return;
    }
    match socks5_step(s) {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            ctx.stats.record_socks5_error();
            error!("{} SOCKS5 {}", s, e);
            write_rst(ctx, s);
            return;
        }
    }

    info!("{} connected", s);
    s.remote_seq = s.remote_seq.wrapping_add(1);
    if write_syn_ack(ctx, s).is_ok() {
        s.last_active = ctx.now;
        s.local_seq = s.local_seq.wrapping_add(1);
        s.state = TcpState::SynRecv;
    }
}

/// One step of the proxy handshake. True once the tunnel is up.
fn socks5_step(s: &mut TcpSession) -> Result<bool> {
    let (Some(socket), Some(client)) = (s.socket.as_ref(), s.socks5.as_mut()) else {
        return Ok(true);
    };
    if client.is_done() {
        return Ok(true);
    }
    if s.readable && client.awaiting_reply() {
        let mut buf = [0u8; 512];
        match (&*socket).read(&mut buf) {
            Ok(0) => return Err(SinkholeError::Socks5("proxy closed the connection".into())),
            Ok(n) => {
                let state = client.on_reply(&buf[..n])?;
                debug!("SOCKS5 {:?}", state);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => s.readable = false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    if client.is_done() {
        return Ok(true);
    }
    if let Some(msg) = client.request() {
        socket.send_with_flags(&msg, libc::MSG_NOSIGNAL)?;
    }
    Ok(false)
}

fn forward_step(ctx: &mut Context<'_>, s: &mut TcpSession) {
    let mut forwarded = false;
    if s.writable && !s.forward.is_empty() {
        if let Some(socket) = s.socket.as_ref() {
            let budget = relay::send_buffer_free(socket);
            let outcome = s.forward.drain(&mut s.remote_seq, budget, |data, more| {
                let flags = libc::MSG_NOSIGNAL | if more { libc::MSG_MORE } else { 0 };
                socket.send_with_flags(data, flags)
            });
            s.sent += outcome.forwarded as u64;
            forwarded = outcome.forwarded > 0;
            match outcome.error {
                None => {}
                Some(e) if e.kind() == io::ErrorKind::WouldBlock => s.writable = false,
                Some(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Some(e) => {
                    error!("{} send error {}", s, e);
                    write_rst(ctx, s);
                    return;
                }
            }
            if let Some(front) = s.forward.front() {
                debug!(
                    "{} queued {}..{} sent {}",
                    s,
                    front.seq.wrapping_sub(s.remote_start),
                    front.end().wrapping_sub(s.remote_start),
                    front.sent
                );
            }
        }
    }

    let prev = s.recv_window;
    s.recv_window = s.receive_window();
    if (prev == 0) != (s.recv_window == 0) {
        debug!("{} recv window {} > {}", s, prev, s.recv_window);
    }

    if forwarded || (prev == 0 && s.recv_window > 0) {
        if forwarded && s.forward.is_empty() && s.state == TcpState::CloseWait {
            info!("{} confirm FIN", s);
            s.remote_seq = s.remote_seq.wrapping_add(1);
        }
        if write_ack(ctx, s).is_ok() {
            s.last_active = ctx.now;
        }
    }
}

fn read_step(ctx: &mut Context<'_>, s: &mut TcpSession) {
    let mut buf = Vec::new();
    for _ in 0..TCP_READ_BUDGET {
        if !s.readable || !matches!(s.state, TcpState::Established | TcpState::CloseWait) {
            return;
        }
        let window = s.send_window_available();
        if window == 0 {
            return;
        }
        let Some(socket) = s.socket.as_ref() else {
            return;
        };
        let size = window.min(s.mss as u32).max(1) as usize;
        buf.resize(size, 0);

        match (&*socket).read(&mut buf[..size]) {
            Ok(0) => {
                on_eof(ctx, s);
                return;
            }
            Ok(n) => {
                s.last_active = ctx.now;
                s.received += n as u64;
                if write_data(ctx, s, &buf[..n]).is_err() {
                    return;
                }
                s.local_seq = s.local_seq.wrapping_add(n as u32);
                s.keep_alive = None;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => s.readable = false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!("{} recv error {}", s, e);
                write_rst(ctx, s);
                return;
            }
        }
    }
}

fn on_eof(ctx: &mut Context<'_>, s: &mut TcpSession) {
    info!("{} recv eof", s);
    if s.forward.is_empty() {
        if write_fin_ack(ctx, s).is_ok() {
            s.local_seq = s.local_seq.wrapping_add(1);
        }
        match s.state {
            TcpState::Established => s.state = TcpState::FinWait1,
            TcpState::CloseWait => s.state = TcpState::LastAck,
            _ => error!("{} invalid close", s),
        }
    } else {
        error!("{} close with queue", s);
        write_rst(ctx, s);
    }
    ctx.close_socket(&mut s.socket);
    s.readable = false;
    s.writable = false;
}

fn write_tcp(ctx: &mut Context<'_>, s: &TcpSession, flags: TcpFlags, payload: &[u8]) -> Result<()> {
    let options = if flags.syn {
        TcpOptions {
            mss: Some(default_mss(ctx.config.mtu, s.key.version)),
            window_scale: (s.recv_scale > 0).then_some(s.recv_scale),
        }
    } else {
        TcpOptions::default()
    };
    let seg = TcpSegment {
        sport: s.key.dport,
        dport: s.key.sport,
        seq: s.local_seq,
        ack: s.remote_seq,
        flags,
        window: (s.recv_window >> s.recv_scale).min(u16::MAX as u32) as u16,
        options,
        payload,
    };
    let packet = wire::build_tcp(s.key.dst, s.key.src, &seg);
    ctx.tun.write(&packet)
}

/// Segment writers; a failed write ends the session.
fn write_or_close(ctx: &mut Context<'_>, s: &mut TcpSession, flags: TcpFlags, payload: &[u8]) -> Result<()> {
    let r = write_tcp(ctx, s, flags, payload);
    if r.is_err() {
        s.state = TcpState::Closing;
    }
    r
}

fn write_syn_ack(ctx: &mut Context<'_>, s: &mut TcpSession) -> Result<()> {
    write_or_close(ctx, s, TcpFlags::syn_ack(), &[])
}

fn write_ack(ctx: &mut Context<'_>, s: &mut TcpSession) -> Result<()> {
    write_or_close(ctx, s, TcpFlags::ack_only(), &[])
}

fn write_data(ctx: &mut Context<'_>, s: &mut TcpSession, data: &[u8]) -> Result<()> {
    write_or_close(ctx, s, TcpFlags::psh_ack(), data)
}

fn write_fin_ack(ctx: &mut Context<'_>, s: &mut TcpSession) -> Result<()> {
    write_or_close(ctx, s, TcpFlags::fin_ack(), &[])
}

/// Reset the local application's connection and wind the session down.
pub(crate) fn write_rst(ctx: &mut Context<'_>, s: &mut TcpSession) {
    if write_tcp(ctx, s, TcpFlags::rst_ack(), &[]).is_ok() {
        ctx.stats.record_reset();
    }
    if s.state != TcpState::Close {
        s.state = TcpState::Closing;
    }
}

/// Policy revocation.
pub(crate) fn revoke(ctx: &mut Context<'_>, s: &mut TcpSession) {
    if s.is_active() {
        write_rst(ctx, s);
    }
}

/// Sweep step. Returns false once the session should be dropped.
pub(crate) fn check(ctx: &mut Context<'_>, s: &mut TcpSession) -> bool {
    let timeout = s.timeout(&ctx.config.tcp, ctx.counts.total(), ctx.max_sessions);
    let idle = ctx.now.saturating_duration_since(s.last_active);
    if s.is_active() && expired(idle, timeout) {
        warn!("{} idle {}/{} sec", s, idle.as_secs(), timeout);
        if s.state == TcpState::Listen {
            s.state = TcpState::Closing;
        } else {
            write_rst(ctx, s);
        }
    }

    if s.state == TcpState::Closing {
        info!("{} close", s);
        ctx.close_socket(&mut s.socket);
        s.readable = false;
        s.writable = false;
        s.last_active = ctx.now;
        s.state = TcpState::Close;
    }

    if !s.is_active() && (s.sent > 0 || s.received > 0) {
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

    let idle = ctx.now.saturating_duration_since(s.last_active);
    !(s.state == TcpState::Close && expired(idle, ctx.config.tcp.keep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::IPPROTO_TCP;
    use std::net::IpAddr;

    fn key() -> FlowKey {
        FlowKey {
            version: IpVersion::V4,
            protocol: IPPROTO_TCP,
            src: IpAddr::from([10, 0, 0, 2]),
            sport: 40000,
            dst: IpAddr::from([93, 184, 216, 34]),
            dport: 443,
        }
    }

    fn syn(seq: u32, window: u16, mss: Option<u16>, ws: Option<u8>) -> TcpHeader {
        TcpHeader {
            sport: 40000,
            dport: 443,
            seq,
            ack: 0,
            header_len: 20,
            flags: TcpFlags {
                syn: true,
                ..Default::default()
            },
            window,
            options: TcpOptions { mss, window_scale: ws },
        }
    }

    fn drain_all(q: &mut ForwardQueue, remote_seq: &mut u32) -> Vec<u8> {
        let mut out = Vec::new();
        q.drain(remote_seq, usize::MAX, |data, _| {
            out.extend_from_slice(data);
            Ok(data.len())
        });
        out
    }

    #[test]
    fn compare_handles_wraparound() {
        assert_eq!(compare_u32(1, 2), Ordering::Less);
        assert_eq!(compare_u32(5, 5), Ordering::Equal);
        assert_eq!(compare_u32(0, u32::MAX), Ordering::Greater);
        assert_eq!(compare_u32(u32::MAX - 10, 10), Ordering::Less);
    }

    #[test]
    fn default_mss_fits_the_mtu() {
        assert_eq!(default_mss(1500, IpVersion::V4), 1460);
        assert_eq!(default_mss(1500, IpVersion::V6), 1440);
        assert_eq!(default_mss(10000, IpVersion::V4), 9960);
    }

    #[test]
    fn syn_sets_up_windows_and_sequence_numbers() {
        let s = TcpSession::from_syn(key(), None, &syn(1000, 1024, Some(1400), Some(7)), 9960, Instant::now());
        assert_eq!(s.state, TcpState::Listen);
        assert_eq!(s.mss, 1400);
        assert_eq!((s.send_scale, s.recv_scale), (7, 7));
        assert_eq!(s.send_window, 1024 << 7);
        assert_eq!((s.remote_seq, s.remote_start), (1000, 1000));
        assert_eq!(s.local_seq, s.local_start);
        assert!(s.is_active());

        let plain = TcpSession::from_syn(key(), None, &syn(1, 65535, None, Some(40)), 9960, Instant::now());
        assert_eq!(plain.mss, 9960);
        assert_eq!(plain.send_scale, MAX_WINDOW_SCALE);
    }

    #[test]
    fn send_window_shrinks_with_unacked_data() {
        let mut s = TcpSession::from_syn(key(), None, &syn(1, 1000, None, None), 1460, Instant::now());
        s.acked = s.local_seq;
        assert_eq!(s.send_window_available(), 1000);
        s.local_seq = s.local_seq.wrapping_add(600);
        assert_eq!(s.send_window_available(), 400);
        s.local_seq = s.local_seq.wrapping_add(600);
        assert_eq!(s.send_window_available(), 0);
        s.acked = s.local_seq.wrapping_add(5);
        assert_eq!(s.send_window_available(), 0);
    }

    #[test]
    fn timeouts_by_state() {
        let cfg = TcpTimeouts::default();
        let mut s = TcpSession::from_syn(key(), None, &syn(1, 1000, None, None), 1460, Instant::now());
        assert_eq!(s.timeout(&cfg, 0, 100), 30);
        s.state = TcpState::Established;
        assert_eq!(s.timeout(&cfg, 0, 100), 300);
        s.keep_alive = Some(Instant::now());
        assert_eq!(s.timeout(&cfg, 0, 100), 150);
        assert_eq!(s.timeout(&cfg, 50, 100), 75);
        s.state = TcpState::LastAck;
        assert_eq!(s.timeout(&cfg, 0, 100), 30);
        s.state = TcpState::Closing;
        assert!(!s.is_active());
    }

    #[test]
    fn queue_orders_and_dedupes() {
        let mut q = ForwardQueue::new();
        assert!(q.insert(100, 110, b"world", false));
        assert!(q.insert(100, 100, b"hello-----", true));
        assert!(!q.insert(100, 110, b"WORLD", false));
        assert!(!q.insert(100, 90, b"old", false));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pending_bytes(), 15);

        let mut seq = 100;
        assert_eq!(drain_all(&mut q, &mut seq), b"hello-----world");
        assert_eq!(seq, 115);
        assert!(q.is_empty());
    }

    #[test]
    fn longer_retransmission_replaces_shorter() {
        let mut q = ForwardQueue::new();
        q.insert(0, 0, b"ab", false);
        assert!(q.insert(0, 0, b"abcd", false));
        assert!(!q.insert(0, 0, b"a", false));
        assert_eq!(q.pending_bytes(), 4);
        let mut seq = 0;
        assert_eq!(drain_all(&mut q, &mut seq), b"abcd");
    }

    #[test]
    fn drain_stops_at_gap_and_budget() {
        let mut q = ForwardQueue::new();
        q.insert(0, 0, b"abc", false);
        q.insert(0, 5, b"fgh", false);
        let mut seq = 0;
        assert_eq!(drain_all(&mut q, &mut seq), b"abc");
        assert_eq!(seq, 3);
        assert_eq!(q.len(), 1);

        q.insert(seq, 3, b"de", false);
        let outcome = q.drain(&mut seq, 4, |data, _| Ok(data.len()));
        assert_eq!(outcome.forwarded, 2);
        assert_eq!(seq, 5);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn partial_send_keeps_remainder() {
        let mut q = ForwardQueue::new();
        q.insert(0, 0, b"abcdef", true);
        let mut seq = 0;
        let outcome = q.drain(&mut seq, usize::MAX, |data, more| {
            assert!(!more);
            Ok(data.len().min(4))
        });
        assert_eq!(outcome.forwarded, 4);
        assert_eq!(seq, 4);
        assert_eq!(drain_all(&mut q, &mut seq), b"ef");

        q.insert(seq, seq, b"xyz", false);
        let outcome = q.drain(&mut seq, usize::MAX, |_, _| Err(io::ErrorKind::WouldBlock.into()));
        assert_eq!(outcome.forwarded, 0);
        assert_eq!(outcome.error.unwrap().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(q.pending_bytes(), 3);
    }

    #[test]
    fn sequence_space_wraps() {
        let mut q = ForwardQueue::new();
        let start = u32::MAX - 2;
        q.insert(start, start.wrapping_add(4), b"EF", false);
        q.insert(start, start, b"ABCD", false);
        let mut seq = start;
        assert_eq!(drain_all(&mut q, &mut seq), b"ABCDEF");
        assert_eq!(seq, 3);
    }
}
