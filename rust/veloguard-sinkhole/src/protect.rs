//! Keeping outbound sockets off the tun route
//!
//! Every socket the engine opens is handed to a [`SocketProtector`] before
//! it connects, so the host can bind it outside the VPN. Hosts that cannot
//! pass a trait object (e.g. across FFI) register a process-wide callback
//! instead and use [`GlobalProtector`].

use parking_lot::RwLock;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use tracing::{info, warn};

type ProtectFn = Arc<dyn Fn(RawFd) -> bool + Send + Sync>;

/// Process-wide protect callback. A `RwLock` so it can be reset on restart.
static PROTECT_CALLBACK: RwLock<Option<ProtectFn>> = RwLock::new(None);

pub fn set_protect_callback<F>(callback: F)
where
    F: Fn(RawFd) -> bool + Send + Sync + 'static,
{
    *PROTECT_CALLBACK.write() = Some(Arc::new(callback));
    info!("Socket protect callback registered");
}

pub fn clear_protect_callback() {
    *PROTECT_CALLBACK.write() = None;
    info!("Socket protect callback cleared");
}

pub fn has_protect_callback() -> bool {
    PROTECT_CALLBACK.read().is_some()
}

pub trait SocketProtector: Send + Sync {
    fn protect(&self, fd: RawFd) -> io::Result<()>;
}

/// For hosts where the engine's sockets never route through the tun.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProtect;

impl SocketProtector for NoProtect {
    fn protect(&self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }
}

/// Wraps a host closure.
pub struct CallbackProtector {
    callback: ProtectFn,
}

impl CallbackProtector {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(RawFd) -> bool + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }
}

impl SocketProtector for CallbackProtector {
    fn protect(&self, fd: RawFd) -> io::Result<()> {
        if (self.callback)(fd) {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::Other, format!("protect fd {} failed", fd)))
        }
    }
}

/// Uses the callback registered with [`set_protect_callback`].
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalProtector;

impl SocketProtector for GlobalProtector {
    fn protect(&self, fd: RawFd) -> io::Result<()> {
        let callback = PROTECT_CALLBACK.read().clone();
        match callback {
            Some(cb) if cb(fd) => Ok(()),
            Some(_) => {
                warn!("Socket fd={} protection failed", fd);
                Err(io::Error::new(io::ErrorKind::Other, format!("protect fd {} failed", fd)))
            }
            None => {
                warn!("No protect callback set for socket fd={}, traffic may loop", fd);
                Err(io::Error::new(io::ErrorKind::NotConnected, "no protect callback"))
            }
        }
    }
}
