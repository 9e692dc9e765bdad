//! The crate's recoverable-error surface. Per `SPEC_FULL.md` §7, only the
//! constructor paths that can fail for reasons outside a programmer's
//! control (a port already in use, a bad address) return `Result`;
//! everything else that represents a broken invariant (a duplicate
//! `EventLoop` on one thread, a poller call from the wrong thread) stays
//! `panic!`-on-violation, matching the original's `LOG_FATAL` story.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to construct reactor core: {0}")]
    Reactor(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
