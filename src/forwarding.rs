//! Shared address-to-socket forwarding table.
//!
//! Every peer consults this table on every packet, without taking the
//! router's peer-table lock. Keys are raw socket-address octets so a lookup
//! value can be derived straight from a packet header.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::sync::{Mutex, MutexGuard};

use nix::libc;
use tracing::trace;

/// Fixed key width. Large enough for a socket address of any supported
/// family; unused trailing octets stay zero.
pub const KEY_LEN: usize = 56;

/// A forwarding key: address family, port in network order, address octets,
/// zero padding. Equality and hashing are byte-wise.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrKey([u8; KEY_LEN]);

impl AddrKey {
    /// Build a key from an IPv4 socket address.
    pub fn from_socket_addr(addr: SocketAddrV4) -> Self {
        let mut key = [0u8; KEY_LEN];
        key[0..2].copy_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
        key[2..4].copy_from_slice(&addr.port().to_be_bytes());
        key[4..8].copy_from_slice(&addr.ip().octets());
        Self(key)
    }

    /// Build the lookup key for a datagram destination: the address with
    /// port zero, exactly as the forwarding policy inserts it.
    pub fn from_destination(addr: Ipv4Addr) -> Self {
        Self::from_socket_addr(SocketAddrV4::new(addr, 0))
    }
}

impl fmt::Debug for AddrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = u16::from_be_bytes([self.0[2], self.0[3]]);
        let addr = Ipv4Addr::new(self.0[4], self.0[5], self.0[6], self.0[7]);
        write!(f, "AddrKey({addr}:{port})")
    }
}

/// Mutex-guarded map from forwarding key to destination socket.
///
/// The value slot holds the bare socket handle rather than a peer reference:
/// forwarding survives the transient absence of a peer and is consulted
/// without touching the router.
pub struct ForwardingMap {
    entries: Mutex<HashMap<AddrKey, RawFd>>,
}

/// Locked access to the table for the handler hot path.
pub struct ForwardingGuard<'a> {
    entries: MutexGuard<'a, HashMap<AddrKey, RawFd>>,
}

impl ForwardingGuard<'_> {
    /// Resolve a key to its destination socket.
    pub fn get(&self, key: &AddrKey) -> Option<RawFd> {
        self.entries.get(key).copied()
    }

    /// Insert or replace an entry.
    pub fn put(&mut self, key: AddrKey, socket: RawFd) {
        self.entries.insert(key, socket);
    }
}

impl ForwardingMap {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace an entry. A later insert for the same key wins.
    pub fn put(&self, key: AddrKey, socket: RawFd) {
        self.entries.lock().unwrap().insert(key, socket);
        trace!(?key, socket, "Forwarding entry added");
    }

    /// Resolve a key to its destination socket.
    pub fn get(&self, key: &AddrKey) -> Option<RawFd> {
        self.entries.lock().unwrap().get(key).copied()
    }

    /// Remove an entry.
    pub fn remove(&self, key: &AddrKey) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Try-acquire the table for a handler. Returns `None` when the lock is
    /// contended; the caller defers its packet to the next tick instead of
    /// blocking inside the dispatcher.
    pub fn try_lock(&self) -> Option<ForwardingGuard<'_>> {
        self.entries
            .try_lock()
            .ok()
            .map(|entries| ForwardingGuard { entries })
    }

    /// Drop every entry pointing at the given socket. Called when the owner
    /// of that socket is evicted so stale handles can never be resolved.
    pub fn remove_socket(&self, socket: RawFd) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, fd| *fd != socket);
        before - entries.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ForwardingMap {
    fn default() -> Self {
        Self::new()
    }
}
