//! Error taxonomy for the forwarding engine.
//!
//! Per-packet problems are swallowed by the peers (quiet drop); everything
//! that reaches the caller of `Router::run` is either a stop request or a
//! torn setup/invariant.

use std::os::unix::io::RawFd;

use thiserror::Error;

/// Errors surfaced by the router and its peers.
#[derive(Debug, Error)]
pub enum Error {
    /// The event loop was asked to stop. Fatal to the current tick, not to
    /// the process.
    #[error("event loop interrupted")]
    Interrupted,

    /// A handler could not complete a read or write against its source
    /// socket. The router evicts the offending peer and continues.
    #[error("handler lost its source socket")]
    HandlerRead,

    /// Readiness-facility or allocation failure. The failed operation is a
    /// no-op.
    #[error("resources exhausted: {0}")]
    Resources(#[source] std::io::Error),

    /// An event arrived for a descriptor with no peer-table entry. The
    /// peer-table/readiness-facility invariant is broken.
    #[error("no handler registered for descriptor {0}")]
    NoHandler(RawFd),

    /// A non-IPv4 frame was observed. Never surfaced out of a handler; the
    /// packet is dropped.
    #[error("unknown packet format")]
    UnknownPacket,
}

pub type Result<T> = std::result::Result<T, Error>;
