//! Error types shared across the peer runtime.

use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LcpError>;

/// Errors surfaced by the core. Per the error-handling design, none of
/// these ever unwind out of a worker task — every task boundary converts
/// them into a logged event, a wire `Response`, or both.
#[derive(Debug, Error)]
pub enum LcpError {
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed datagram: {0}")]
    Malformed(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("peer {0:?} is not known")]
    UnknownPeer(String),

    #[error("no response waiter registered for {0}")]
    NoWaiter(SocketAddr),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel closed")]
    ChannelClosed,
}

impl LcpError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout(what.into())
    }
}
