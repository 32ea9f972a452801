//! IPv4 forwarding peer.
//!
//! Reads one datagram per readiness event, resolves the destination address
//! through the shared forwarding map and relays the untouched bytes to the
//! resolved socket. Reading at most one datagram per event bounds how long
//! a single peer can monopolise the dispatcher.

use std::net::SocketAddrV4;
use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::errno::Errno;
use nix::unistd;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::forwarding::{AddrKey, ForwardingMap};
use crate::packet::Ipv4View;
use crate::peer::Peer;

/// Receive buffer size: the maximum IPv4 datagram.
pub const READ_BUF_SIZE: usize = 65536;

/// A forwarding peer bound to one byte-oriented source.
pub struct L3Peer {
    fd: OwnedFd,
    address: SocketAddrV4,
    /// Record the source address of relayed datagrams in the forwarding
    /// map. Enabled on TCP peers so return traffic resolves; the TUN peer
    /// never learns.
    learn_source: bool,
    buf: Mutex<Box<[u8]>>,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl L3Peer {
    pub fn new(fd: OwnedFd, address: SocketAddrV4) -> Self {
        Self {
            fd,
            address,
            learn_source: false,
            buf: Mutex::new(vec![0u8; READ_BUF_SIZE].into_boxed_slice()),
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// A peer that additionally binds the source address of every relayed
    /// datagram to its own socket.
    pub fn with_source_learning(fd: OwnedFd, address: SocketAddrV4) -> Self {
        Self {
            learn_source: true,
            ..Self::new(fd, address)
        }
    }

    /// Datagrams relayed to a destination socket.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Datagrams dropped: non-IPv4, truncated, or destination unknown.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn drop_packet(&self) -> Result<()> {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write the whole slice to the destination socket. Transient failures
    /// retry; a gone or forbidden destination is promoted to `HandlerRead`.
    fn write_all(&self, socket: RawFd, mut data: &[u8]) -> Result<()> {
        let dest = unsafe { BorrowedFd::borrow_raw(socket) };
        while !data.is_empty() {
            match unistd::write(dest, data) {
                Ok(n) => data = &data[n..],
                Err(Errno::EACCES | Errno::EPIPE) => {
                    debug!(socket, "Destination socket gone");
                    return Err(Error::HandlerRead);
                }
                Err(_) => continue,
            }
        }
        Ok(())
    }
}

impl Peer for L3Peer {
    fn socket(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn address(&self) -> SocketAddrV4 {
        self.address
    }

    fn handle(&self, map: &ForwardingMap) -> Result<()> {
        let mut buf = self.buf.lock().unwrap();

        // One read per event. A failed or empty read means the source is
        // gone and the router should evict this peer.
        let n = match unistd::read(self.fd.as_raw_fd(), &mut buf[..]) {
            Ok(0) => {
                debug!(fd = self.socket(), "Source closed");
                return Err(Error::HandlerRead);
            }
            Ok(n) => n,
            Err(e) => {
                debug!(fd = self.socket(), error = %e, "Source read failed");
                return Err(Error::HandlerRead);
            }
        };

        // Non-IPv4 traffic (stray ARP and friends) must not tear the peer
        // down: classification failures are swallowed here.
        let header = match classify(&buf[..n]) {
            Ok(header) => header,
            Err(Error::UnknownPacket) => {
                trace!(fd = self.socket(), len = n, "Not an IPv4 frame, dropping");
                return self.drop_packet();
            }
            Err(e) => return Err(e),
        };

        // The header's total length delimits the datagram; when it claims
        // more than this read returned, forward it anyway and trust the
        // sender.
        let total_len = (header.total_len() as usize).min(buf.len());
        let destination = header.destination();
        let key = AddrKey::from_destination(destination);
        let learn = self
            .learn_source
            .then(|| AddrKey::from_destination(header.source()));

        let socket = {
            let Some(mut entries) = map.try_lock() else {
                trace!(fd = self.socket(), "Forwarding map contended, deferring");
                return self.drop_packet();
            };
            if let Some(source_key) = learn {
                entries.put(source_key, self.socket());
            }
            entries.get(&key)
        };

        let Some(socket) = socket else {
            trace!(fd = self.socket(), dst = %destination, "No route, dropping");
            return self.drop_packet();
        };

        self.write_all(socket, &buf[..total_len])?;
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        trace!(
            fd = self.socket(),
            dst = %destination,
            len = total_len,
            "Forwarded datagram"
        );
        Ok(())
    }
}

/// Interpret a receive buffer as an IPv4 datagram.
fn classify(frame: &[u8]) -> Result<Ipv4View<'_>> {
    let header = Ipv4View::new(frame).ok_or(Error::UnknownPacket)?;
    if header.version() != 4 {
        return Err(Error::UnknownPacket);
    }
    Ok(header)
}
