// ABOUTME: Crate-wide error types for framing, connection, and acceptor failures
// ABOUTME: Each layer gets its own thiserror enum; they compose upward via #[from]

use std::io;
use thiserror::Error;

/// Errors raised while reading or writing length-prefixed frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame length {length} is negative or zero is not representable")]
    NegativeLength { length: i32 },

    #[error("frame length {length} exceeds configured maximum {max}")]
    TooLarge { length: u32, max: u32 },

    #[error("peer closed the connection")]
    Eof,

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("I/O error while framing: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced while driving a single connection's handshake or
/// request-dispatch loop.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("handshake refused: {0}")]
    HandshakeRefused(String),

    #[error("authentication failed for scheme {scheme}")]
    AuthFailed { scheme: String },

    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by the acceptor loop itself. None of these are allowed
/// to propagate out of `Acceptor::run`; they are logged and the offending
/// connection (never the reactor) is closed.
#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("accept() failed: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to build the reactor runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// Boxed error alias used at crate edges (public API return types, demo
/// binaries) where callers do not need to match on a specific variant.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
