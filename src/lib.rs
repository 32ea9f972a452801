//! User-space IPv4 tunnel router.
//!
//! Architecture:
//! - A single-threaded, epoll-driven [`router::Router`] per instance
//! - Peers ([`peer::Peer`]) bind a descriptor to a handler; the
//!   [`l3::L3Peer`] variant forwards IPv4 datagrams
//! - A shared [`forwarding::ForwardingMap`] resolves destination addresses
//!   to sockets without touching the router
//! - TUN and TCP collaborators ([`tun`], [`transport`]) feed descriptors in

pub mod error;
pub mod forwarding;
pub mod l3;
pub mod packet;
pub mod peer;
pub mod router;
pub mod transport;
pub mod tun;

pub use error::{Error, Result};
pub use forwarding::{AddrKey, ForwardingMap};
pub use l3::L3Peer;
pub use packet::Ipv4View;
pub use peer::{Peer, PrintingPeer};
pub use router::Router;
pub use tun::TunDevice;
