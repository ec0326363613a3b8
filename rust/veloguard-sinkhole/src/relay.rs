//! Outbound sockets
//!
//! Every socket is protected, made non-blocking and, for TCP, connected
//! without waiting: completion is reported by the poller as writability.

use crate::config::Socks5Config;
use crate::error::{Result, SinkholeError};
use crate::packet::IpVersion;
use crate::protect::SocketProtector;
use crate::socks5::Socks5Client;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use tracing::{debug, warn};

/// Send buffer size assumed when the kernel reports zero.
pub const DEFAULT_SEND_BUFFER: usize = 16384;

/// Where a TCP session's socket connects, and the proxy handshake if any.
#[derive(Debug)]
pub struct ConnectPlan {
    pub addr: SocketAddr,
    pub socks5: Option<Socks5Client>,
}

/// Redirect first, then the SOCKS5 upstream, then the original destination.
pub fn plan_connect(dst: SocketAddr, redirect: Option<SocketAddr>, socks5: Option<&Socks5Config>) -> ConnectPlan {
    if let Some(addr) = redirect {
        return ConnectPlan { addr, socks5: None };
    }
    match socks5 {
        Some(cfg) => ConnectPlan {
            addr: cfg.address,
            socks5: Some(Socks5Client::connect(dst, cfg.credentials())),
        },
        None => ConnectPlan { addr: dst, socks5: None },
    }
}

fn domain_for(version: IpVersion) -> Domain {
    match version {
        IpVersion::V4 => Domain::IPV4,
        IpVersion::V6 => Domain::IPV6,
    }
}

fn protect(socket: &Socket, protector: &dyn SocketProtector) -> Result<()> {
    protector.protect(socket.as_raw_fd()).map_err(|e| {
        warn!("Failed to protect socket fd={}: {}", socket.as_raw_fd(), e);
        SinkholeError::Io(e)
    })
}

/// Start a non-blocking connect. `EINPROGRESS` is success.
pub fn open_tcp(addr: SocketAddr, protector: &dyn SocketProtector) -> Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    protect(&socket, protector)?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e.into()),
    }
    debug!("connecting fd={} to {}", socket.as_raw_fd(), addr);
    Ok(socket)
}

/// Unconnected UDP socket for datagrams to `dst`.
pub fn open_udp(version: IpVersion, dst: IpAddr, protector: &dyn SocketProtector) -> Result<Socket> {
    let socket = Socket::new(domain_for(version), Type::DGRAM, Some(Protocol::UDP))?;
    protect(&socket, protector)?;
    socket.set_nonblocking(true)?;

    match dst {
        IpAddr::V4(a) if a == Ipv4Addr::BROADCAST => {
            socket.set_broadcast(true)?;
        }
        IpAddr::V6(a) if a.is_multicast() => {
            socket.set_multicast_loop_v6(true)?;
            set_multicast_hops_default(&socket)?;
            socket.join_multicast_v6(&a, 0)?;
        }
        _ => {}
    }
    Ok(socket)
}

/// Hop limit -1 selects the route default, which socket2 cannot express.
fn set_multicast_hops_default(socket: &Socket) -> io::Result<()> {
    let hops: libc::c_int = -1;
    // SAFETY: the option value is a valid c_int for the duration of the call.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_MULTICAST_HOPS,
            &hops as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Unprivileged echo socket.
pub fn open_icmp(version: IpVersion, protector: &dyn SocketProtector) -> Result<Socket> {
    let protocol = match version {
        IpVersion::V4 => Protocol::ICMPV4,
        IpVersion::V6 => Protocol::ICMPV6,
    };
    let socket = Socket::new(domain_for(version), Type::DGRAM, Some(protocol))?;
    protect(&socket, protector)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Free space in the kernel send buffer: half of `SO_SNDBUF` minus the
/// bytes still queued.
pub fn send_buffer_free(socket: &Socket) -> usize {
    let sndbuf = match socket.send_buffer_size() {
        Ok(0) | Err(_) => DEFAULT_SEND_BUFFER,
        Ok(n) => n,
    };
    let mut queued: libc::c_int = 0;
    // SAFETY: TIOCOUTQ writes one c_int into `queued`.
    let rc = unsafe { libc::ioctl(socket.as_raw_fd(), libc::TIOCOUTQ as _, &mut queued) };
    let queued = if rc < 0 { 0 } else { queued.max(0) as usize };
    (sndbuf / 2).saturating_sub(queued)
}

/// Pending asynchronous error, e.g. a failed connect.
pub fn pending_error(socket: &Socket) -> Option<io::Error> {
    match socket.take_error() {
        Ok(e) => e,
        Err(e) => Some(e),
    }
}
