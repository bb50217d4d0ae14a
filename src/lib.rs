//! Library crate for forkproxy: a pre-forking request proxy.
//!
//! Each worker process runs one single-threaded epoll dispatch loop over its
//! connections (`core`, `proxy`), evicting backend requests that miss their
//! deadline through a lazily purged timeout queue (`timeout`). The parent
//! process owns the worker pool (`pool`) and the shared key → value table
//! (`coordinator`), which workers reach over a 9-byte record channel
//! (`channel`). Workers also send best-effort liveness notes (`notify`).
//!
//! The binary (`main.rs`) only parses flags, sets up logging and drives the
//! pool; everything else is here so it can be tested in-process.

pub mod channel;
pub mod config;
pub mod conn;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod event;
pub mod msg;
pub mod notify;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod stats;
pub mod timeout;
