//! Readiness-multiplexing router.
//!
//! Owns the epoll instance and the peer table, and drives the event loop:
//! wait for readiness, look up the owning peer, invoke its handler. One
//! call to [`Router::run`] is a single tick; the caller re-enters it until
//! shutdown.

use std::collections::HashMap;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::forwarding::ForwardingMap;
use crate::peer::Peer;

/// Event-driven forwarder over a set of registered peers.
pub struct Router {
    epoll: Epoll,
    /// Capacity of the per-wait event batch.
    max_concurrent: usize,
    /// Milliseconds one wait may block.
    wait_timeout: u16,
    /// Descriptor to peer. The key set mirrors the epoll interest list.
    peers: Mutex<HashMap<RawFd, Arc<dyn Peer>>>,
    map: Arc<ForwardingMap>,
}

impl Router {
    /// Create a router with an empty peer table and forwarding map.
    ///
    /// `max_concurrent` bounds how many events one wait may return;
    /// `wait_timeout` is the epoll wait timeout in milliseconds.
    pub fn new(max_concurrent: usize, wait_timeout: u16) -> Result<Self> {
        assert!(max_concurrent >= 1);
        let epoll = Epoll::new(EpollCreateFlags::empty())
            .map_err(|e| Error::Resources(e.into()))?;
        Ok(Self {
            epoll,
            max_concurrent,
            wait_timeout,
            peers: Mutex::new(HashMap::new()),
            map: Arc::new(ForwardingMap::new()),
        })
    }

    /// The forwarding map shared by every peer of this router.
    pub fn forwarding_map(&self) -> Arc<ForwardingMap> {
        Arc::clone(&self.map)
    }

    /// Whether a descriptor currently has a registered peer.
    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.peers.lock().unwrap().contains_key(&fd)
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Register a peer and subscribe its socket for read-readiness OR'd
    /// with `flags`.
    ///
    /// Write-readiness subscription is a programming error: the engine
    /// inlines writes and never parks on them.
    ///
    /// The table insert happens before the epoll subscription so a spurious
    /// early event can never find a missing peer. On subscription failure
    /// the insert is rolled back and `Resources` is returned.
    pub fn register(&self, peer: Arc<dyn Peer>, flags: EpollFlags) -> Result<()> {
        assert!(
            !flags.contains(EpollFlags::EPOLLOUT),
            "peers must not subscribe for write-readiness"
        );

        let fd = peer.socket();
        let mut peers = self.peers.lock().unwrap();
        peers.insert(fd, peer);

        let event = EpollEvent::new(EpollFlags::EPOLLIN | flags, fd as u64);
        if let Err(e) = self.epoll.add(unsafe { BorrowedFd::borrow_raw(fd) }, event) {
            peers.remove(&fd);
            return Err(Error::Resources(e.into()));
        }

        debug!(fd, "Registered peer");
        Ok(())
    }

    /// Remove a peer from the readiness facility and the peer table.
    ///
    /// The epoll removal comes first, and its errors are ignored: the
    /// descriptor may already be closed. Once this returns, no dispatch
    /// will reference the peer again.
    pub fn unregister(&self, peer: &dyn Peer) {
        let fd = peer.socket();
        let mut peers = self.peers.lock().unwrap();
        let _ = self.epoll.delete(unsafe { BorrowedFd::borrow_raw(fd) });
        peers.remove(&fd);
        debug!(fd, "Unregistered peer");
    }

    /// One tick of the event loop.
    ///
    /// Waits up to the configured timeout and dispatches every returned
    /// event, looping while a wait keeps producing events. A wait that
    /// returns nothing ends the tick; the caller polls liveness and
    /// re-enters.
    pub fn run(&self) -> Result<()> {
        let mut events = vec![EpollEvent::empty(); self.max_concurrent];

        loop {
            let n = match self.epoll.wait(&mut events, self.wait_timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => return Err(Error::Interrupted),
                Err(e) => return Err(Error::Resources(e.into())),
            };

            for event in &events[..n] {
                self.dispatch(event)?;
            }

            if n == 0 {
                return Ok(());
            }
        }
    }

    /// Dispatch one readiness event to its peer.
    fn dispatch(&self, event: &EpollEvent) -> Result<()> {
        let fd = event.data() as RawFd;

        let peer = match self.peers.try_lock() {
            Ok(peers) => match peers.get(&fd) {
                Some(peer) => Arc::clone(peer),
                None => return Err(Error::NoHandler(fd)),
            },
            // A register/unregister is in flight. Read-readiness is
            // level-triggered, so the event is re-reported on the next
            // wait instead of being lost.
            Err(_) => {
                trace!(fd, "Peer table contended, deferring event");
                return Ok(());
            }
        };

        // The lock is released here; handlers may freely touch other
        // routers and maps.
        match peer.handle(&self.map) {
            Ok(()) => Ok(()),
            Err(Error::HandlerRead) => {
                warn!(fd, "Peer lost its source, evicting");
                self.unregister(peer.as_ref());
                let scrubbed = self.map.remove_socket(fd);
                if scrubbed > 0 {
                    debug!(fd, scrubbed, "Scrubbed forwarding entries");
                }
                Ok(())
            }
            Err(Error::Interrupted) => Err(Error::Interrupted),
            // Handlers only signal the two kinds above; anything else is a
            // defect and surfaces to the caller.
            Err(e) => Err(e),
        }
    }
}
