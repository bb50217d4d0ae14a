//! Startup bundle and sizing constants.
//!
//! `ProxyConfig` is built once in the parent and every worker receives its own
//! copy at fork time. Protocol sizes shared by the codecs live here as well.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::SetupError;

/// Max ready events fetched per multiplexer wait.
pub const EVENT_BATCH_SIZE: usize = 1024;

/// Bytes pulled from a socket per recv call.
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Initial connection slab capacity per worker. Grows on demand.
pub const SLAB_CAPACITY: usize = 4096;

/// Largest request/response frame payload accepted from a peer.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Backlog for the shared listening socket.
pub const LISTEN_BACKLOG: i32 = 1024;

/// Worker slots are used as table keys and log fields.
pub const MAX_WORKERS: usize = 256;

/// Records a channel end may hold unsent before further sends are refused.
pub const MAX_CHANNEL_BACKLOG: usize = 4096;

pub const DEFAULT_SERVER_TIMEOUT_MS: u64 = 400;
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_CHANNEL_TIMEOUT_MS: u64 = 1_000;

const _: () = assert!(
    MAX_FRAME_LEN <= u32::MAX as usize,
    "frame length is a u32 on the wire"
);
const _: () = assert!(
    MAX_WORKERS <= u32::MAX as usize,
    "worker slot is used as a u32 table key"
);

/// Everything a worker needs to run, fixed before the first fork.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Client-facing listen address.
    pub listen: SocketAddr,
    /// Backend servers, selected round-robin per accepted client.
    pub servers: Vec<SocketAddr>,
    /// Number of worker processes.
    pub workers: usize,
    /// Per-request deadline on the backend. `None` disables request timeouts.
    pub server_timeout: Option<Duration>,
    /// Stats publish interval. Also the upper bound on one multiplexer wait.
    pub stats_interval: Duration,
    /// How long `remote_get` waits for the coordinator before giving up.
    pub channel_timeout: Duration,
}

impl ProxyConfig {
    pub fn new(listen: SocketAddr, servers: Vec<SocketAddr>) -> Self {
        Self {
            listen,
            servers,
            workers: 1,
            server_timeout: Some(Duration::from_millis(DEFAULT_SERVER_TIMEOUT_MS)),
            stats_interval: Duration::from_millis(DEFAULT_STATS_INTERVAL_MS),
            channel_timeout: Duration::from_millis(DEFAULT_CHANNEL_TIMEOUT_MS),
        }
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(SetupError::Config(format!(
                "workers must be in 1..={MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if self.servers.is_empty() {
            return Err(SetupError::Config("at least one backend is required".into()));
        }
        if self.stats_interval.is_zero() {
            return Err(SetupError::Config("stats interval must be non-zero".into()));
        }
        if self.server_timeout.is_some_and(|t| t.is_zero()) {
            return Err(SetupError::Config("server timeout must be non-zero".into()));
        }
        if self.channel_timeout.is_zero() {
            return Err(SetupError::Config("channel timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Upper bound on one multiplexer wait, in epoll's millisecond unit.
    pub fn max_timeout_ms(&self) -> i32 {
        duration_to_ms(self.stats_interval)
    }
}

/// Round a duration up to whole milliseconds, saturating at `i32::MAX`.
pub fn duration_to_ms(d: Duration) -> i32 {
    let ms = d.as_micros().div_ceil(1000);
    ms.min(i32::MAX as u128) as i32
}
