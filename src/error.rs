//! Error types for startup, the coordination channel and the dispatch loop.
//!
//! Per-connection failures are not here: they are recorded on the connection
//! as an errno and resolved by closing it.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Fatal to pool creation. Everything acquired before the failure is dropped.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to create event multiplexer: {0}")]
    Event(#[source] io::Error),

    #[error("failed to create coordination channel: {0}")]
    Channel(#[source] io::Error),

    #[error("fork of worker {slot} failed: {source}")]
    Fork {
        slot: usize,
        #[source]
        source: nix::Error,
    },
}

/// Failures on a worker's coordination channel endpoint.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel i/o: {0}")]
    Io(#[from] io::Error),

    #[error("channel closed by peer")]
    Closed,

    #[error("no reply within {0} ms")]
    Timeout(u64),

    #[error("value {0} is reserved as the not-found marker")]
    ReservedValue(i32),

    #[error("unknown command kind {0}")]
    UnknownKind(u8),

    #[error("peer is not reading, {0} records already queued")]
    Backlog(usize),

    #[error("unexpected reply for key {got}, waiting on {want}")]
    KeyMismatch { want: u32, got: u32 },
}

/// Fatal to a worker's dispatch loop.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("event wait failed: {0}")]
    Wait(#[source] io::Error),
}
