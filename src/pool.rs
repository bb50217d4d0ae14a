//! Fork-based worker pool.
//!
//! The parent binds the listening socket, creates the coordinator, then forks
//! one worker per slot. Each worker inherits the listener, builds its own
//! `Context` and runs the dispatch loop until it is killed. The parent never
//! accepts; it serves the shared table and reaps workers.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use socket2::Socket;
use tracing::{debug, error, info, info_span, warn};

use crate::channel::ChannelEndpoint;
use crate::config::ProxyConfig;
use crate::coordinator::Coordinator;
use crate::core::Context;
use crate::error::{LoopError, SetupError};
use crate::notify::{self, Notifier};
use crate::proxy::create_listener;

/// How long one coordinator wait may block while serving the pool.
pub const COORDINATOR_POLL_MS: i32 = 100;

#[derive(Debug, Clone, Copy)]
pub struct WorkerSlot {
    pub slot: usize,
    pub pid: Pid,
    pub ctx_id: u32,
    pub alive: bool,
}

pub struct WorkerPool {
    cfg: ProxyConfig,
    listener: Option<Socket>,
    listen_addr: SocketAddr,
    workers: Vec<WorkerSlot>,
    coordinator: Option<Coordinator>,
    next_ctx_id: u32,
    /// Only the process that built the pool may signal its workers.
    owner: u32,
}

impl WorkerPool {
    /// Bind, create the coordinator and fork every worker. If any step fails,
    /// workers already forked are terminated before the error is returned.
    pub fn init(cfg: ProxyConfig) -> Result<Self, SetupError> {
        cfg.validate()?;

        let listener = create_listener(cfg.listen)?;
        let listen_addr = listener
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(cfg.listen);
        let coordinator = Coordinator::new()?;

        let mut pool = Self {
            workers: Vec::with_capacity(cfg.workers),
            cfg,
            listener: Some(listener),
            listen_addr,
            coordinator: Some(coordinator),
            next_ctx_id: 1,
            owner: process::id(),
        };

        for slot in 0..pool.cfg.workers {
            if let Err(e) = pool.spawn(slot) {
                error!(slot, error = %e, "worker spawn failed, unwinding pool");
                pool.shutdown();
                return Err(e);
            }
        }

        info!(
            workers = pool.workers.len(),
            listen = %pool.listen_addr,
            "pool ready"
        );
        Ok(pool)
    }

    fn spawn(&mut self, slot: usize) -> Result<(), SetupError> {
        let (worker_end, coord_end) =
            ChannelEndpoint::pair(self.cfg.channel_timeout).map_err(SetupError::Channel)?;
        let (notifier, receiver) = notify::pair(slot).map_err(SetupError::Channel)?;
        let ctx_id = self.next_ctx_id;
        self.next_ctx_id += 1;

        // SAFETY: the child only touches state it owns outright and leaves
        // through process::exit without returning to the caller.
        let forked = unsafe { fork() }.map_err(|source| SetupError::Fork { slot, source })?;
        match forked {
            ForkResult::Child => {
                drop(coord_end);
                drop(receiver);
                // other workers' coordinator ends must not stay open here
                drop(self.coordinator.take());

                let code = match self.listener.take() {
                    Some(listener) => {
                        let cfg = &self.cfg;
                        panic::catch_unwind(AssertUnwindSafe(|| {
                            worker_main(cfg, slot, ctx_id, listener, worker_end, notifier)
                        }))
                        .unwrap_or(101)
                    }
                    None => 1,
                };
                process::exit(code);
            }
            ForkResult::Parent { child } => {
                drop(worker_end);
                drop(notifier);
                self.workers.push(WorkerSlot {
                    slot,
                    pid: child,
                    ctx_id,
                    alive: true,
                });
                if let Some(coordinator) = self.coordinator.as_mut() {
                    coordinator.add_channel(slot, coord_end)?;
                    coordinator.add_notes(slot, receiver)?;
                }
                info!(slot, pid = child.as_raw(), ctx_id, "spawned worker");
                Ok(())
            }
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn workers(&self) -> &[WorkerSlot] {
        &self.workers
    }

    pub fn alive_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.alive).count()
    }

    pub fn coordinator(&self) -> Option<&Coordinator> {
        self.coordinator.as_ref()
    }

    /// Serve the shared table for up to `timeout_ms`, then reap any worker
    /// that exited. Returns the number of table commands applied.
    pub fn serve_once(&mut self, timeout_ms: i32) -> Result<usize, LoopError> {
        let applied = match self.coordinator.as_mut() {
            Some(coordinator) => coordinator.serve_once(timeout_ms)?,
            None => 0,
        };
        self.reap();
        Ok(applied)
    }

    /// Serve until `stop` is raised or every worker is gone.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), LoopError> {
        while !stop.load(Ordering::Relaxed) {
            self.serve_once(COORDINATOR_POLL_MS)?;
            if self.alive_workers() == 0 {
                warn!("all workers exited");
                break;
            }
        }
        Ok(())
    }

    /// Collect exited workers without blocking.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        for w in self.workers.iter_mut().filter(|w| w.alive) {
            match waitpid(w.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(WaitStatus::Exited(_, code)) => {
                    warn!(slot = w.slot, pid = w.pid.as_raw(), code, "worker exited");
                    w.alive = false;
                    reaped += 1;
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    warn!(slot = w.slot, pid = w.pid.as_raw(), signal = ?sig, "worker killed");
                    w.alive = false;
                    reaped += 1;
                }
                Ok(status) => debug!(slot = w.slot, ?status, "worker status"),
                Err(Errno::ECHILD) => {
                    w.alive = false;
                    reaped += 1;
                }
                Err(e) => warn!(slot = w.slot, error = %e, "waitpid failed, ignored"),
            }
        }
        reaped
    }

    /// Terminate and wait for every live worker.
    pub fn shutdown(&mut self) {
        if process::id() != self.owner {
            return;
        }
        for w in self.workers.iter().filter(|w| w.alive) {
            match signal::kill(w.pid, Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(slot = w.slot, error = %e, "kill worker failed"),
            }
        }
        for w in self.workers.iter_mut().filter(|w| w.alive) {
            loop {
                match waitpid(w.pid, None) {
                    Err(Errno::EINTR) => continue,
                    Ok(status) => debug!(slot = w.slot, ?status, "worker reaped"),
                    Err(e) => debug!(slot = w.slot, error = %e, "worker already gone"),
                }
                break;
            }
            w.alive = false;
        }
        info!(workers = self.workers.len(), "pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.alive_workers() > 0 {
            self.shutdown();
        }
    }
}

fn worker_main(
    cfg: &ProxyConfig,
    slot: usize,
    ctx_id: u32,
    listener: Socket,
    channel: ChannelEndpoint,
    notifier: Notifier,
) -> i32 {
    let span = info_span!("worker", slot, pid = process::id());
    let _enter = span.enter();

    reset_signals();

    let mut ctx = match Context::new(ctx_id, slot, cfg) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "create ctx failed");
            return 1;
        }
    };
    if let Err(e) = ctx.add_listener(listener) {
        error!(error = %e, "register listener failed");
        return 1;
    }
    if let Err(e) = ctx.attach_channel(channel) {
        warn!(error = %e, "register coordination channel failed, running without it");
    }
    ctx.attach_notifier(notifier);

    info!(ctx_id, "worker running");
    let code = match ctx.run() {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "dispatch loop failed");
            1
        }
    };
    ctx.shutdown();
    let totals = ctx.stats.destroy();
    info!(
        requests = totals.requests,
        responses = totals.responses,
        timed_out = totals.server_timedout,
        "worker exiting"
    );
    code
}

/// Workers take the default action on termination signals, whatever the
/// parent installed.
fn reset_signals() {
    for sig in [Signal::SIGTERM, Signal::SIGINT] {
        // SAFETY: restoring the default disposition installs no handler code.
        if let Err(e) = unsafe { signal::signal(sig, SigHandler::SigDfl) } {
            warn!(signal = ?sig, error = %e, "reset signal failed");
        }
    }
}
