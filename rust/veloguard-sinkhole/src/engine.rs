//! Event loop and control surface
//!
//! One thread owns the tun device, the poller and every session socket.
//! Other threads only reach the engine through an [`EngineHandle`], which
//! shares the session table behind a coarse lock and wakes the loop.
//!
//! Each pass of [`Engine::run_once`]:
//!
//! ```text
//! reload? ──> check_allowed ──> sweep ──> wait ──> poll
//!                                                   │
//!            socket events ──> icmp/udp/tcp on_ready
//!            tun readable  ──> decode ──> admission ──> icmp/udp/tcp handle
//!            service pass over TCP sessions with pending work
//! ```

use crate::config::EngineConfig;
use crate::error::{is_transient_io, Result, SinkholeError};
use crate::icmp;
use crate::packet::{self, is_expected_protocol, Packet, Transport, IPPROTO_UDP};
use crate::policy::{Collaborators, FlowQuery, PacketLog};
use crate::session::{
    default_max_sessions, split_token, FlowKey, Session, SessionCounts, SessionTable, TUN_TOKEN, WAKER_TOKEN,
};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::tcp;
use crate::tun::{self, TunDevice, TunWriter};
use crate::udp::{self, UdpState};
use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use socket2::Socket;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const DNS_PORT: u16 = 53;

/// Extra second added to a session deadline so the sweep sees it expired.
const DEADLINE_SLACK: Duration = Duration::from_secs(1);

/// Readiness of one socket, as reported by a single poll event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// What a protocol handler may touch while processing one unit of work.
pub(crate) struct Context<'a> {
    pub(crate) config: &'a EngineConfig,
    pub(crate) collab: &'a Collaborators,
    pub(crate) registry: &'a Registry,
    pub(crate) stats: &'a EngineStats,
    pub(crate) tun: TunWriter<'a>,
    /// Active sessions per protocol at the start of the pass.
    pub(crate) counts: SessionCounts,
    pub(crate) max_sessions: usize,
    pub(crate) now: Instant,
}

impl Context<'_> {
    pub(crate) fn register(&self, socket: &Socket, token: Token, interest: Interest) -> Result<()> {
        let fd = socket.as_raw_fd();
        self.registry.register(&mut SourceFd(&fd), token, interest)?;
        trace!("fd={} registered as {:?}", fd, token);
        Ok(())
    }

    pub(crate) fn deregister(&self, socket: &Socket) {
        let fd = socket.as_raw_fd();
        if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
            debug!("fd={} deregister failed: {}", fd, e);
        }
    }

    /// Deregister and close the socket in `slot`, if any.
    pub(crate) fn close_socket(&self, slot: &mut Option<Socket>) {
        if let Some(socket) = slot.take() {
            self.deregister(&socket);
        }
    }
}

/// State shared between the loop and its handles.
struct Shared {
    table: Mutex<SessionTable>,
    running: AtomicBool,
    stopping: AtomicBool,
    reload: AtomicBool,
    waker: Waker,
    stats: EngineStats,
}

impl Shared {
    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("engine wake failed: {}", e);
        }
    }
}

/// The parts of the engine that stay borrowed immutably during a pass.
struct Core {
    config: EngineConfig,
    collab: Collaborators,
    registry: Registry,
    shared: Arc<Shared>,
    max_sessions: usize,
}

impl Core {
    fn context<'a>(
        &'a self,
        tun: &'a mut dyn TunDevice,
        fatal: &'a mut Option<io::Error>,
        counts: SessionCounts,
    ) -> Context<'a> {
        Context {
            config: &self.config,
            collab: &self.collab,
            registry: &self.registry,
            stats: &self.shared.stats,
            tun: TunWriter::new(tun, &self.shared.stats, fatal),
            counts,
            max_sessions: self.max_sessions,
            now: Instant::now(),
        }
    }
}

/// Packet-processing engine bound to one tun device.
pub struct Engine<T: TunDevice> {
    core: Core,
    tun: T,
    poll: Poll,
    events: Events,
    fatal: Option<io::Error>,
    buf: Vec<u8>,
    /// The last tun read stopped at the budget, not at WouldBlock.
    tun_pending: bool,
}

impl<T: TunDevice> Engine<T> {
    pub fn new(config: EngineConfig, tun: T, collab: Collaborators) -> Result<Self> {
        config.validate()?;
        let fd = tun.as_raw_fd();
        tun::set_nonblocking(fd)?;

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        registry.register(&mut SourceFd(&fd), TUN_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let max_sessions = config.max_sessions.unwrap_or_else(default_max_sessions);
        info!("engine created: tun fd={} mtu {} max sessions {}", fd, config.mtu, max_sessions);

        let shared = Arc::new(Shared {
            table: Mutex::new(SessionTable::new()),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            // Existing sessions are checked against the policy on the first pass.
            reload: AtomicBool::new(true),
            waker,
            stats: EngineStats::new(),
        });

        Ok(Self {
            buf: vec![0u8; config.mtu],
            core: Core {
                config,
                collab,
                registry,
                shared,
                max_sessions,
            },
            tun,
            poll,
            events: Events::with_capacity(1024),
            fatal: None,
            tun_pending: false,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.core.shared),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn max_sessions(&self) -> usize {
        self.core.max_sessions
    }

    /// Run until [`EngineHandle::stop`] is called or the tun fails.
    pub fn run(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.core.shared);
        shared.running.store(true, Ordering::SeqCst);
        info!("engine running");

        let result = loop {
            if shared.stopping.load(Ordering::SeqCst) {
                break Ok(());
            }
            if let Err(e) = self.run_once(None) {
                error!("engine loop failed: {}", e);
                break Err(e);
            }
        };

        let sessions = shared.table.lock().clear();
        for s in &sessions {
            if let Some(socket) = session_socket(s) {
                let fd = socket.as_raw_fd();
                if let Err(e) = self.core.registry.deregister(&mut SourceFd(&fd)) {
                    debug!("fd={} deregister failed: {}", fd, e);
                }
            }
        }
        info!("engine stopped, {} sessions released", sessions.len());
        drop(sessions);

        shared.stopping.store(false, Ordering::SeqCst);
        shared.running.store(false, Ordering::SeqCst);
        result
    }

    /// One pass of the loop. `timeout` caps the poll wait.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        let Engine {
            core,
            tun,
            poll,
            events,
            fatal,
            buf,
            tun_pending,
        } = self;

        let wait = {
            let mut table = core.shared.table.lock();
            let mut ctx = core.context(&mut *tun, &mut *fatal, table.counts());
            if core.shared.reload.swap(false, Ordering::AcqRel) {
                check_allowed(&mut ctx, &mut table);
                ctx.counts = table.counts();
            }
            sweep(&mut ctx, &mut table);
            ctx.counts = table.counts();
            let wait = if *tun_pending {
                Duration::ZERO
            } else {
                next_wait(&ctx, &table)
            };
            timeout.map_or(wait, |t| t.min(wait))
        };

        trace!("poll wait {:?}", wait);
        match poll.poll(events, Some(wait)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let mut read_tun = *tun_pending;
        let mut table = core.shared.table.lock();
        let counts = table.counts();
        for event in events.iter() {
            match event.token() {
                TUN_TOKEN => read_tun = true,
                WAKER_TOKEN => trace!("engine woken"),
                token => {
                    let mut ctx = core.context(&mut *tun, &mut *fatal, counts);
                    on_socket_ready(&mut ctx, &mut table, token, Readiness::from(event));
                }
            }
        }

        if read_tun {
            *tun_pending = read_packets(core, &mut *tun, &mut *fatal, buf, &mut table)?;
        }

        let mut ctx = core.context(&mut *tun, &mut *fatal, counts);
        for (_, s) in table.iter_mut() {
            if let Session::Tcp(s) = s {
                if s.readable || (s.writable && !s.forward.is_empty()) {
                    tcp::service(&mut ctx, s);
                }
            }
        }
        drop(ctx);
        drop(table);

        match fatal.take() {
            Some(e) => Err(SinkholeError::Tun(e)),
            None => Ok(()),
        }
    }
}

fn session_socket(s: &Session) -> Option<&Socket> {
    match s {
        Session::Icmp(s) => s.socket.as_ref(),
        Session::Udp(s) => s.socket.as_ref(),
        Session::Tcp(s) => s.socket.as_ref(),
    }
}

/// Read the tun until it runs dry or the budget is spent.
///
/// Returns true when packets may still be waiting.
fn read_packets(
    core: &Core,
    tun: &mut dyn TunDevice,
    fatal: &mut Option<io::Error>,
    buf: &mut [u8],
    table: &mut SessionTable,
) -> Result<bool> {
    let counts = table.counts();
    for _ in 0..core.config.tun_read_budget {
        let n = match tun.recv_packet(buf) {
            Ok(0) => {
                error!("tun closed");
                return Err(SinkholeError::Tun(io::Error::from(io::ErrorKind::UnexpectedEof)));
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if is_transient_io(&e) => continue,
            Err(e) => {
                error!("tun read error: {}", e);
                return Err(SinkholeError::Tun(e));
            }
        };
        let mut ctx = core.context(&mut *tun, &mut *fatal, counts);
        handle_packet(&mut ctx, table, &buf[..n]);
        drop(ctx);
        if fatal.is_some() {
            return Ok(false);
        }
    }
    debug!("tun read budget of {} spent", core.config.tun_read_budget);
    Ok(true)
}

/// Decode one packet from the tun and pass it through admission.
pub(crate) fn handle_packet(ctx: &mut Context<'_>, table: &mut SessionTable, data: &[u8]) {
    ctx.stats.record_received(data.len());
    let pkt = match packet::decode(data, ctx.config.verify_ip_checksum) {
        Ok(pkt) => pkt,
        Err(e) => {
            debug!("packet dropped: {}", e);
            ctx.stats.record_invalid();
            return;
        }
    };
    ctx.stats.record_protocol(pkt.protocol);

    if !is_expected_protocol(pkt.protocol) {
        report_anomaly(ctx, &pkt);
        return;
    }

    let key = FlowKey::from_packet(&pkt);
    let new_flow = match pkt.transport {
        Transport::Icmp(_) => true,
        Transport::Udp(_) => table.find(&key).is_none(),
        Transport::Tcp(_) => pkt.is_syn(),
        Transport::Other => false,
    };

    if new_flow {
        let active = table.active_count();
        if active >= ctx.max_sessions {
            let e = SinkholeError::SessionLimit {
                active,
                max: ctx.max_sessions,
            };
            warn!("{} refused: {}", key, e);
            ctx.stats.record_refused();
            ctx.stats.record_dropped();
            return;
        }
    }

    let owner = if new_flow {
        ctx.collab
            .owner
            .resolve(pkt.version, pkt.protocol, pkt.src, pkt.sport())
    } else {
        None
    };

    let consult = new_flow && !(pkt.protocol == IPPROTO_UDP && pkt.dport() == DNS_PORT && !ctx.config.dns.filter_flows);
    let (allowed, redirect) = if consult {
        let query = FlowQuery {
            version: pkt.version,
            protocol: pkt.protocol,
            flags: pkt.flags_string(),
            src: pkt.src,
            sport: pkt.sport(),
            dst: pkt.dst,
            dport: pkt.dport(),
            owner,
        };
        let decision = ctx.collab.policy.is_flow_allowed(&query);
        ctx.collab.observer.log_packet(&PacketLog {
            version: query.version,
            protocol: query.protocol,
            flags: query.flags,
            src: query.src,
            sport: query.sport,
            dst: query.dst,
            dport: query.dport,
            data: String::new(),
            owner,
            allowed: decision.is_some(),
        });
        match decision {
            Some(target) => (true, target.socket_addr()),
            None => (false, None),
        }
    } else {
        (true, None)
    };

    if !allowed {
        debug!("{} {}", key, SinkholeError::PolicyDenied);
        ctx.stats.record_denied();
        if let Transport::Udp(_) = pkt.transport {
            udp::block(ctx, table, &pkt, owner);
        }
        return;
    }

    let result = match pkt.transport {
        Transport::Icmp(_) => icmp::handle(ctx, table, &pkt, owner),
        Transport::Udp(_) => udp::handle(ctx, table, &pkt, owner, redirect),
        Transport::Tcp(_) => tcp::handle(ctx, table, &pkt, owner, redirect),
        Transport::Other => {
            trace!("{} protocol {} not relayed", key, pkt.protocol);
            Ok(())
        }
    };
    match result {
        Ok(()) => {}
        Err(e) if e.is_transient() => debug!("{} deferred: {}", key, e),
        Err(e) => warn!("{} failed: {}", key, e),
    }
}

/// Protocols the engine never expects on the tun are reported, then dropped.
fn report_anomaly(ctx: &Context<'_>, pkt: &Packet<'_>) {
    warn!("unexpected protocol {} from {} to {}", pkt.protocol, pkt.src, pkt.dst);
    ctx.collab.observer.log_packet(&PacketLog {
        version: pkt.version,
        protocol: pkt.protocol,
        flags: "?".to_string(),
        src: pkt.src,
        sport: 0,
        dst: pkt.dst,
        dport: 0,
        data: String::new(),
        owner: None,
        allowed: false,
    });
}

fn on_socket_ready(ctx: &mut Context<'_>, table: &mut SessionTable, token: Token, ready: Readiness) {
    let (id, control) = split_token(token);
    match table.get_mut(id) {
        Some(Session::Icmp(s)) => icmp::on_ready(ctx, s, ready),
        Some(Session::Udp(s)) => udp::on_ready(ctx, s, ready, control),
        Some(Session::Tcp(s)) => tcp::on_ready(ctx, s, ready),
        None => trace!("event for gone session {}", id),
    }
}

/// Ask the policy again about every live session and tear down the ones it
/// no longer allows. BLOCKED placeholders are dropped so the next datagram
/// gets a fresh decision.
fn check_allowed(ctx: &mut Context<'_>, table: &mut SessionTable) {
    let collab = ctx.collab;
    let filter_dns = ctx.config.dns.filter_flows;
    table.retain(|_, s| {
        if let Session::Udp(u) = s {
            if u.state == UdpState::Blocked {
                return udp::revoke(u);
            }
        }
        if !s.is_active() {
            return true;
        }
        let key = *s.key();
        if key.protocol == IPPROTO_UDP && key.dport == DNS_PORT && !filter_dns {
            return true;
        }
        let query = FlowQuery {
            version: key.version,
            protocol: key.protocol,
            flags: String::new(),
            src: key.src,
            sport: key.sport,
            dst: key.dst,
            dport: key.dport,
            owner: s.owner(),
        };
        if collab.policy.is_flow_allowed(&query).is_some() {
            return true;
        }
        warn!("{} no longer allowed", key);
        match s {
            Session::Icmp(s) => {
                icmp::revoke(s);
                true
            }
            Session::Udp(s) => udp::revoke(s),
            Session::Tcp(s) => {
                tcp::revoke(ctx, s);
                true
            }
        }
    });
}

fn sweep(ctx: &mut Context<'_>, table: &mut SessionTable) {
    table.retain(|id, s| {
        let keep = match s {
            Session::Icmp(s) => icmp::check(ctx, s),
            Session::Udp(s) => udp::check(ctx, s),
            Session::Tcp(s) => tcp::check(ctx, s),
        };
        if !keep {
            debug!("session {} removed: {}", id, s.key());
        }
        keep
    });
}

/// Time until the earliest active session expires, clamped to the
/// configured check interval and select timeout.
fn next_wait(ctx: &Context<'_>, table: &SessionTable) -> Duration {
    let cfg = ctx.config;
    let mut wait = cfg.select_timeout();
    for (_, s) in table.iter() {
        let timeout = match s {
            Session::Icmp(s) if !s.stopped => s.timeout(cfg.icmp_timeout, ctx.counts.total(), ctx.max_sessions),
            Session::Udp(s) if s.is_active() => s.timeout(&cfg.udp, ctx.counts.udp),
            Session::Tcp(s) if s.is_active() => {
                if s.backlogged() {
                    return Duration::ZERO;
                }
                s.timeout(&cfg.tcp, ctx.counts.total(), ctx.max_sessions)
            }
            _ => continue,
        };
        let deadline = s.last_active() + Duration::from_secs(timeout) + DEADLINE_SLACK;
        wait = wait.min(deadline.saturating_duration_since(ctx.now));
    }
    wait.clamp(cfg.min_check_interval().min(cfg.select_timeout()), cfg.select_timeout())
}

/// Thread-safe control over a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    /// Ask the loop to exit. Idempotent.
    pub fn stop(&self) {
        if !self.shared.stopping.swap(true, Ordering::SeqCst) {
            info!("engine stop requested");
        }
        self.shared.wake();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Drop every session and close its sockets.
    pub fn clear_sessions(&self) {
        let sessions = self.shared.table.lock().clear();
        info!("cleared {} sessions", sessions.len());
    }

    pub fn session_counts(&self) -> SessionCounts {
        self.shared.table.lock().counts()
    }

    pub fn session_count(&self) -> usize {
        self.shared.table.lock().len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn table(&self) -> parking_lot::MutexGuard<'_, SessionTable> {
        self.shared.table.lock()
    }

    /// Re-check every session against the policy on the next pass.
    pub fn reload_policy(&self) {
        self.shared.reload.store(true, Ordering::Release);
        self.shared.wake();
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("running", &self.is_running())
            .field("sessions", &self.session_count())
            .finish()
    }
}
