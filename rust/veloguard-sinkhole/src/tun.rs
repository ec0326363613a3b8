//! Tun device access
//!
//! The engine needs only a packet-preserving, pollable descriptor. On Linux
//! that is a `/dev/net/tun` queue opened with `IFF_NO_PI`; tests use one end
//! of a `UnixDatagram` pair.

use crate::error::{is_transient_io, Result, SinkholeError};
use crate::stats::EngineStats;
use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use tracing::{debug, error, info};

pub trait TunDevice: AsRawFd + Send {
    fn recv_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn send_packet(&mut self, packet: &[u8]) -> io::Result<usize>;
}

impl TunDevice for UnixDatagram {
    fn recv_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }

    fn send_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.send(packet)
    }
}

/// An owned tun descriptor.
#[derive(Debug)]
pub struct TunFd {
    fd: OwnedFd,
}

impl TunFd {
    /// Take ownership of a descriptor opened by the host.
    ///
    /// # Safety
    ///
    /// `fd` must be an open tun descriptor not owned by anything else.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    /// Attach to (or create) the interface `name`.
    #[cfg(target_os = "linux")]
    pub fn open(name: &str) -> Result<Self> {
        const TUNSETIFF: libc::c_ulong = 0x400454ca;

        #[repr(C)]
        struct IfReq {
            name: [libc::c_char; libc::IFNAMSIZ],
            flags: libc::c_short,
            _pad: [u8; 22],
        }

        if name.len() >= libc::IFNAMSIZ {
            return Err(SinkholeError::Config(format!("interface name {} too long", name)));
        }
        let path = CString::new("/dev/net/tun").map_err(|e| SinkholeError::Config(e.to_string()))?;
        // SAFETY: path is a valid C string.
        let raw = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if raw < 0 {
            return Err(SinkholeError::Tun(io::Error::last_os_error()));
        }
        // SAFETY: raw was just opened and is owned by nobody else.
        let dev = unsafe { Self::from_raw(raw) };

        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }
        // SAFETY: req outlives the call and matches struct ifreq's layout.
        let rc = unsafe { libc::ioctl(dev.as_raw_fd(), TUNSETIFF as _, &mut req) };
        if rc < 0 {
            return Err(SinkholeError::Tun(io::Error::last_os_error()));
        }
        info!("Opened tun interface {}", name);
        Ok(dev)
    }
}

impl AsRawFd for TunFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn cvt(rc: isize) -> io::Result<usize> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

impl TunDevice for TunFd {
    fn recv_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for buf.len() bytes.
        cvt(unsafe { libc::read(self.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) })
    }

    fn send_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        // SAFETY: packet is valid for packet.len() bytes.
        cvt(unsafe { libc::write(self.as_raw_fd(), packet.as_ptr() as *const _, packet.len()) })
    }
}

/// Switch a descriptor to non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a caller-provided descriptor; failures are reported.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Writes packets to the tun and remembers the first fatal failure.
pub(crate) struct TunWriter<'a> {
    dev: &'a mut dyn TunDevice,
    stats: &'a EngineStats,
    fatal: &'a mut Option<io::Error>,
}

impl<'a> TunWriter<'a> {
    pub(crate) fn new(
        dev: &'a mut dyn TunDevice,
        stats: &'a EngineStats,
        fatal: &'a mut Option<io::Error>,
    ) -> Self {
        Self { dev, stats, fatal }
    }

    pub(crate) fn write(&mut self, packet: &[u8]) -> Result<()> {
        match self.dev.send_packet(packet) {
            Ok(n) if n == packet.len() => {
                self.stats.record_sent(n);
                Ok(())
            }
            Ok(n) => {
                error!("tun short write {}/{}", n, packet.len());
                self.stats.record_dropped();
                Err(SinkholeError::Io(io::Error::new(io::ErrorKind::WriteZero, "short tun write")))
            }
            Err(e) if is_transient_io(&e) => {
                debug!("tun write dropped: {}", e);
                self.stats.record_dropped();
                Err(SinkholeError::Io(e))
            }
            Err(e) => {
                error!("tun write error: {}", e);
                let copy = io::Error::new(e.kind(), e.to_string());
                if self.fatal.is_none() {
                    *self.fatal = Some(e);
                }
                Err(SinkholeError::Tun(copy))
            }
        }
    }
}
