//! TCP transport collaborator.
//!
//! Server mode runs an accept loop in its own thread; every accepted
//! connection becomes a source-learning [`L3Peer`] registered with the
//! router. Client mode dials one outbound connection and seeds the
//! forwarding map with the peer tunnel addresses named on the command line.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::{AsFd, OwnedFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::epoll::EpollFlags;
use tracing::{debug, error, info, warn};

use crate::forwarding::AddrKey;
use crate::l3::L3Peer;
use crate::peer::Peer;
use crate::router::Router;

/// Milliseconds the accept loop waits per poll before re-checking the
/// shutdown channel.
const ACCEPT_POLL_MS: u16 = 500;

/// Handle to the listener thread.
pub struct ListenerHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Sender<()>,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal the thread and wait for it to finish.
    pub fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Bind the tunnel port and start accepting peers.
pub fn spawn_listener(port: u16, router: Arc<Router>) -> io::Result<ListenerHandle> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = bounded(1);
    let thread = thread::Builder::new()
        .name("tun-accept".to_string())
        .spawn(move || accept_loop(listener, router, shutdown_rx))?;

    info!(addr = %local_addr, "Listening for tunnel peers");
    Ok(ListenerHandle {
        thread: Some(thread),
        shutdown: shutdown_tx,
        local_addr,
    })
}

/// Dial a server and register the connection as a forwarding peer.
///
/// Each address in `peers` is seeded into the forwarding map pointing at
/// the new socket, so locally originated traffic resolves before the
/// server has sent anything.
pub fn connect_peer(
    server: Ipv4Addr,
    port: u16,
    router: &Router,
    peers: &[Ipv4Addr],
) -> io::Result<Arc<L3Peer>> {
    let stream = TcpStream::connect((server, port))?;
    let peer = register_stream(stream, router)?;

    let map = router.forwarding_map();
    for &addr in peers {
        map.put(AddrKey::from_destination(addr), peer.socket());
        debug!(peer = %addr, socket = peer.socket(), "Seeded forwarding entry");
    }

    info!(server = %server, port, "Connected to tunnel server");
    Ok(peer)
}

fn accept_loop(listener: TcpListener, router: Arc<Router>, shutdown: Receiver<()>) {
    loop {
        if shutdown.try_recv().is_ok() {
            info!("Listener shutting down");
            return;
        }

        let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(ACCEPT_POLL_MS)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Listener poll failed");
                return;
            }
        }

        match listener.accept() {
            Ok((stream, remote)) => {
                info!(remote = %remote, "Accepted tunnel peer");
                if let Err(e) = register_stream(stream, &router) {
                    warn!(remote = %remote, error = %e, "Failed to register peer");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }
}

/// Wrap a connected stream in a source-learning peer and register it.
fn register_stream(stream: TcpStream, router: &Router) -> io::Result<Arc<L3Peer>> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;

    let local = match stream.local_addr()? {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
    };

    let peer = Arc::new(L3Peer::with_source_learning(OwnedFd::from(stream), local));
    router
        .register(Arc::clone(&peer) as Arc<dyn Peer>, EpollFlags::empty())
        .map_err(io::Error::other)?;
    Ok(peer)
}
