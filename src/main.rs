use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use forkproxy::config::{
    DEFAULT_CHANNEL_TIMEOUT_MS, DEFAULT_SERVER_TIMEOUT_MS, DEFAULT_STATS_INTERVAL_MS, ProxyConfig,
};
use forkproxy::pool::WorkerPool;

#[derive(Parser)]
#[command(about = "Pre-forking request proxy with per-request backend timeouts")]
struct Args {
    /// Address clients connect to
    #[arg(short, long, default_value = "127.0.0.1:22122")]
    listen: SocketAddr,

    /// Backend server, repeat for round-robin over several
    #[arg(short, long = "backend", required = true)]
    backends: Vec<SocketAddr>,

    /// Number of worker processes
    #[arg(short, long, default_value_t = 1)]
    workers: usize,

    /// Backend request timeout in ms, 0 disables it
    #[arg(short, long, default_value_t = DEFAULT_SERVER_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Interval between stats snapshots in ms
    #[arg(long, default_value_t = DEFAULT_STATS_INTERVAL_MS)]
    stats_interval_ms: u64,

    /// How long a worker waits on the coordinator in ms
    #[arg(long, default_value_t = DEFAULT_CHANNEL_TIMEOUT_MS)]
    channel_timeout_ms: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn install_stop_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(on_stop_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic.
        if let Err(e) = unsafe { signal::sigaction(sig, &action) } {
            warn!(signal = ?sig, error = %e, "install signal handler failed");
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut cfg = ProxyConfig::new(args.listen, args.backends);
    cfg.workers = args.workers;
    cfg.server_timeout = (args.timeout_ms > 0).then(|| Duration::from_millis(args.timeout_ms));
    cfg.stats_interval = Duration::from_millis(args.stats_interval_ms);
    cfg.channel_timeout = Duration::from_millis(args.channel_timeout_ms);

    info!(
        listen = %cfg.listen,
        backends = cfg.servers.len(),
        workers = cfg.workers,
        timeout_ms = args.timeout_ms,
        "forkproxy starting"
    );

    let mut pool = match WorkerPool::init(cfg) {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "pool init failed");
            return ExitCode::FAILURE;
        }
    };

    // after the forks, so workers keep the default dispositions
    install_stop_handlers();

    let result = pool.run(&STOP);
    pool.shutdown();
    match result {
        Ok(()) => {
            info!("forkproxy stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "coordinator loop failed");
            ExitCode::FAILURE
        }
    }
}
