//! Peer abstraction: a descriptor plus a handler.
//!
//! The router treats every peer uniformly through this trait; variants
//! differ only in what `handle` does with a readiness event. A peer owns
//! whatever auxiliary state its handler needs for as long as it stays
//! registered.

use std::net::SocketAddrV4;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use nix::unistd;
use tracing::debug;

use crate::error::{Error, Result};
use crate::forwarding::ForwardingMap;

/// A registered participant in the router.
pub trait Peer: Send + Sync {
    /// The socket handle this peer reads from. Stable for the lifetime of
    /// the registration.
    fn socket(&self) -> RawFd;

    /// The peer's local address; the unspecified address when the peer has
    /// none.
    fn address(&self) -> SocketAddrV4;

    /// Service one readiness event. `Err(HandlerRead)` tells the router the
    /// source is broken and the peer should be evicted; `Err(Interrupted)`
    /// stops the tick.
    fn handle(&self, map: &ForwardingMap) -> Result<()>;
}

/// Diagnostic peer that drains its descriptor and logs what arrived.
///
/// Useful for watching a descriptor without forwarding anything, and as the
/// second concrete variant exercising the trait seam.
pub struct PrintingPeer {
    fd: OwnedFd,
    address: SocketAddrV4,
    buf: Mutex<Box<[u8]>>,
}

impl PrintingPeer {
    pub fn new(fd: OwnedFd, address: SocketAddrV4) -> Self {
        Self {
            fd,
            address,
            buf: Mutex::new(vec![0u8; 2048].into_boxed_slice()),
        }
    }
}

impl Peer for PrintingPeer {
    fn socket(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn address(&self) -> SocketAddrV4 {
        self.address
    }

    fn handle(&self, _map: &ForwardingMap) -> Result<()> {
        let mut buf = self.buf.lock().unwrap();
        match unistd::read(self.fd.as_raw_fd(), &mut buf[..]) {
            Ok(0) | Err(_) => Err(Error::HandlerRead),
            Ok(n) => {
                let head = &buf[..n.min(16)];
                debug!(fd = self.socket(), len = n, ?head, "Inbound bytes");
                Ok(())
            }
        }
    }
}
