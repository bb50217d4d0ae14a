//! Worker context and dispatch loop.
//!
//! One `Context` per worker process. A loop iteration is:
//!
//! 1. wait on the multiplexer for up to `timeout` ms
//! 2. dispatch each ready event to its connection (error > read > write)
//! 3. sweep the timeout queue, which also picks the next wait
//! 4. let the stats publish a snapshot if its interval elapsed
//! 5. send the best-effort notification
//!
//! Only the wait in step 1 blocks. Role-specific recv/send/close live in
//! `proxy`.

use std::io;
use std::time::Instant;

use slab::Slab;
use socket2::Socket;
use tracing::{debug, info, trace, warn};

use crate::channel::ChannelEndpoint;
use crate::config::{EVENT_BATCH_SIZE, ProxyConfig, SLAB_CAPACITY, duration_to_ms};
use crate::conn::{Connection, Role};
use crate::error::{ChannelError, LoopError, SetupError};
use crate::event::{EVENT_READ, EVENT_WRITE, Epoll, Ready};
use crate::msg::{MsgKey, MsgTable};
use crate::notify::Notifier;
use crate::server::ServerPool;
use crate::stats::Stats;
use crate::timeout::{Expiry, TimeoutQueue};

/// Token reserved for the coordination channel registration.
pub const CHANNEL_TOKEN: u64 = u64::MAX;

fn encode_token(key: usize, serial: u32) -> u64 {
    ((serial as u64) << 32) | key as u64
}

fn decode_token(token: u64) -> usize {
    (token & 0xffff_ffff) as usize
}

pub struct Context {
    /// Generation id handed out by the worker pool.
    pub id: u32,
    /// Worker slot, also this worker's key in the shared table.
    pub slot: usize,
    pub(crate) epoll: Epoll,
    ready: Vec<Ready>,
    pub(crate) conns: Slab<Connection>,
    serial: u32,
    pub(crate) msgs: MsgTable,
    pub(crate) tmo: TimeoutQueue<MsgKey>,
    timeout: i32,
    max_timeout: i32,
    pub(crate) server_timeout: Option<std::time::Duration>,
    pub(crate) servers: ServerPool,
    pub stats: Stats,
    channel: Option<ChannelEndpoint>,
    channel_interest: u32,
    notifier: Option<Notifier>,
}

impl Context {
    pub fn new(id: u32, slot: usize, cfg: &ProxyConfig) -> Result<Self, SetupError> {
        let epoll = Epoll::new(EVENT_BATCH_SIZE).map_err(SetupError::Event)?;
        let max_timeout = cfg.max_timeout_ms();
        debug!(id, slot, "created ctx");
        Ok(Self {
            id,
            slot,
            epoll,
            ready: Vec::with_capacity(EVENT_BATCH_SIZE),
            conns: Slab::with_capacity(SLAB_CAPACITY),
            serial: 0,
            msgs: MsgTable::new(),
            tmo: TimeoutQueue::new(),
            timeout: max_timeout,
            max_timeout,
            server_timeout: cfg.server_timeout,
            servers: ServerPool::new(cfg.servers.clone()),
            stats: Stats::create(cfg.stats_interval),
            channel: None,
            channel_interest: 0,
            notifier: None,
        })
    }

    /// Register a socket under `role`. The socket must already be non-blocking.
    pub fn add_conn(&mut self, sock: Socket, role: Role) -> io::Result<usize> {
        let addr = match role {
            Role::Client => sock.peer_addr().ok().and_then(|a| a.as_socket()),
            Role::Proxy => sock.local_addr().ok().and_then(|a| a.as_socket()),
            Role::Server => None,
        };
        self.insert_conn(Connection::new(sock, role, addr))
    }

    pub(crate) fn insert_conn(&mut self, mut conn: Connection) -> io::Result<usize> {
        let entry = self.conns.vacant_entry();
        let key = entry.key();
        self.serial = self.serial.wrapping_add(1);
        conn.token = encode_token(key, self.serial);
        conn.interest = conn.wanted_interest();
        self.epoll.add(&conn, conn.token, conn.interest)?;
        entry.insert(conn);
        Ok(key)
    }

    pub fn add_listener(&mut self, sock: Socket) -> io::Result<usize> {
        sock.set_nonblocking(true)?;
        self.add_conn(sock, Role::Proxy)
    }

    /// Register the coordination channel so async replies are drained as
    /// they arrive.
    pub fn attach_channel(&mut self, channel: ChannelEndpoint) -> io::Result<()> {
        self.epoll.add(&channel, CHANNEL_TOKEN, EVENT_READ)?;
        self.channel = Some(channel);
        self.channel_interest = EVENT_READ;
        Ok(())
    }

    pub fn attach_notifier(&mut self, notifier: Notifier) {
        self.notifier = Some(notifier);
    }

    pub fn channel_mut(&mut self) -> Option<&mut ChannelEndpoint> {
        self.channel.as_mut()
    }

    pub fn conn(&self, key: usize) -> Option<&Connection> {
        self.conns.get(key)
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    pub fn token_of(&self, key: usize) -> Option<u64> {
        self.conns.get(key).map(|c| c.token)
    }

    /// Requests currently indexed by the timeout queue, settled ones included.
    pub fn pending_timeouts(&self) -> usize {
        self.tmo.len()
    }

    pub fn live_requests(&self) -> usize {
        self.msgs.len()
    }

    /// Milliseconds the next multiplexer wait may block.
    pub fn poll_timeout(&self) -> i32 {
        self.timeout
    }

    /// Run until the multiplexer fails.
    pub fn run(&mut self) -> Result<(), LoopError> {
        loop {
            self.run_once()?;
        }
    }

    pub fn run_once(&mut self) -> Result<(), LoopError> {
        let mut ready = std::mem::take(&mut self.ready);
        if let Err(e) = self.epoll.wait(self.timeout, &mut ready) {
            self.ready = ready;
            return Err(LoopError::Wait(e));
        }

        for ev in &ready {
            self.dispatch(*ev);
        }
        self.ready = ready;

        self.timeout_sweep(Instant::now());

        if let Some(snapshot) = self.stats.swap(Instant::now()) {
            self.publish(snapshot.requests);
        }

        self.notify();
        Ok(())
    }

    /// Route one ready event. Error beats read, read beats write, and once a
    /// phase closes the connection nothing else runs for it.
    pub fn dispatch(&mut self, ev: Ready) {
        if ev.token == CHANNEL_TOKEN {
            self.channel_event();
            return;
        }

        let key = decode_token(ev.token);
        let Some(conn) = self.conns.get_mut(key) else {
            trace!(token = ev.token, "event for closed conn");
            return;
        };
        if conn.token != ev.token {
            trace!(token = ev.token, "event for recycled conn slot");
            return;
        }

        trace!(events = format_args!("{:04X}", ev.events), role = %conn.role, fd = conn.fd(), "event");
        conn.events = ev.events;

        if ev.is_error() {
            self.error(key);
            return;
        }

        if ev.is_readable() {
            let status = self.recv(key);
            if status.is_err() || self.is_finished(key) {
                self.close(key);
                return;
            }
        }

        if ev.is_writable() {
            let status = self.send(key);
            if status.is_err() || self.is_finished(key) {
                self.close(key);
                return;
            }
        }

        self.sync_interest(key);
    }

    fn is_finished(&self, key: usize) -> bool {
        self.conns
            .get(key)
            .is_none_or(|c| c.done || c.err.is_some())
    }

    fn recv(&mut self, key: usize) -> io::Result<()> {
        let role = self.conns[key].role;
        let status = match role {
            Role::Proxy => self.proxy_accept(key),
            Role::Client => self.client_recv(key),
            Role::Server => self.server_recv(key),
        };
        if let Err(e) = &status {
            self.record_error(key, e, "recv");
        }
        status
    }

    fn send(&mut self, key: usize) -> io::Result<()> {
        let status = self.conn_send(key);
        if let Err(e) = &status {
            self.record_error(key, e, "send");
        }
        status
    }

    fn record_error(&mut self, key: usize, e: &io::Error, op: &'static str) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        debug!(role = %conn.role, fd = conn.fd(), error = %e, "{op} failed");
        conn.err = Some(e.raw_os_error().unwrap_or(match e.kind() {
            io::ErrorKind::InvalidData => libc::EINVAL,
            io::ErrorKind::NotConnected => libc::ENOTCONN,
            _ => libc::EIO,
        }));
    }

    /// Bring the registered interest in line with what the connection needs.
    pub(crate) fn sync_interest(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        let wanted = conn.wanted_interest();
        if wanted == conn.interest {
            return;
        }
        match self.epoll.modify(&*conn, conn.token, wanted) {
            Ok(()) => conn.interest = wanted,
            Err(e) => warn!(role = %conn.role, fd = conn.fd(), error = %e, "event mod failed, ignored"),
        }
    }

    /// Deregister and release a connection. Unknown keys are ignored, so a
    /// cascade that reaches an already-closed peer is harmless.
    pub fn close(&mut self, key: usize) {
        let Some(conn) = self.conns.get(key) else {
            return;
        };
        let err = conn
            .err
            .map(|e| io::Error::from_raw_os_error(e).to_string())
            .unwrap_or_default();
        debug!(
            role = %conn.role,
            fd = conn.fd(),
            addr = %conn.describe(),
            events = format_args!("{:04X}", conn.events),
            eof = conn.eof,
            done = conn.done,
            rb = conn.recv_bytes,
            sb = conn.send_bytes,
            err = %err,
            "close"
        );

        if let Err(e) = self.epoll.delete(conn) {
            warn!(role = %conn.role, fd = conn.fd(), error = %e, "event del conn failed, ignored");
        }

        let conn = self.conns.remove(key);
        match conn.role {
            Role::Proxy => self.proxy_close(key, conn),
            Role::Client => self.client_close(key, conn),
            Role::Server => self.server_close(key, conn),
        }
    }

    /// Record the pending socket error, then close.
    pub fn error(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        match conn.take_socket_error() {
            Ok(Some(e)) => conn.err = e.raw_os_error().or(Some(libc::EIO)),
            Ok(None) => conn.err = conn.err.or(Some(libc::EIO)),
            Err(e) => {
                warn!(role = %conn.role, fd = conn.fd(), error = %e, "get soerr failed, ignored");
                conn.err = e.raw_os_error().or(Some(libc::EIO));
            }
        }
        self.close(key);
    }

    /// Evict expired requests, closing their backend connections, and set the
    /// next wait. Returns how many requests timed out.
    pub fn timeout_sweep(&mut self, now: Instant) -> usize {
        let mut timed_out = 0;
        loop {
            let msgs = &mut self.msgs;
            let expiry = self.tmo.next_expired(now, |k| {
                let stale = msgs.is_settled(k);
                if stale {
                    msgs.free(k);
                }
                stale
            });

            match expiry {
                Expiry::Idle => {
                    self.timeout = self.max_timeout;
                    return timed_out;
                }
                Expiry::Wait(delta) => {
                    self.timeout = duration_to_ms(delta).min(self.max_timeout);
                    return timed_out;
                }
                Expiry::Expired(k) => {
                    let Some(msg) = self.msgs.get(k) else {
                        continue;
                    };
                    let (id, owner) = (msg.id, msg.owner);
                    match self.conns.get_mut(owner) {
                        Some(conn) if conn.role == Role::Server => {
                            info!(req = id, fd = conn.fd(), "req timed out");
                            conn.err = Some(libc::ETIMEDOUT);
                            self.stats.current.server_timedout += 1;
                            timed_out += 1;
                            self.close(owner);
                        }
                        _ => {
                            self.msgs.free(k);
                        }
                    }
                }
            }
        }
    }

    fn channel_event(&mut self) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        let result = channel.flush().and_then(|_| channel.drain_replies());
        match result {
            Ok(_) => self.sync_channel_interest(),
            Err(ChannelError::Closed) => {
                warn!("coordination channel closed by coordinator");
                self.detach_channel();
            }
            Err(e) => {
                warn!(error = %e, "coordination channel failed");
                self.detach_channel();
            }
        }
    }

    fn sync_channel_interest(&mut self) {
        let Some(channel) = self.channel.as_ref() else {
            return;
        };
        let wanted = if channel.has_pending_output() {
            EVENT_READ | EVENT_WRITE
        } else {
            EVENT_READ
        };
        if wanted == self.channel_interest {
            return;
        }
        match self.epoll.modify(channel, CHANNEL_TOKEN, wanted) {
            Ok(()) => self.channel_interest = wanted,
            Err(e) => warn!(error = %e, "event mod channel failed, ignored"),
        }
    }

    fn detach_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = self.epoll.delete(&channel) {
                warn!(error = %e, "event del channel failed, ignored");
            }
        }
    }

    /// Push this worker's forwarded-request total into the shared table.
    fn publish(&mut self, requests: u64) {
        let slot = self.slot as u32;
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        let value = requests.min(i32::MAX as u64) as i32;
        match channel.put_async(slot, value) {
            Ok(()) => {
                trace!(slot, value, "published request count");
                self.sync_channel_interest();
            }
            Err(ChannelError::Closed) => {
                warn!("coordination channel closed by coordinator");
                self.detach_channel();
            }
            Err(e) => warn!(error = %e, "publish to coordinator failed"),
        }
    }

    fn notify(&mut self) {
        let Some(notifier) = self.notifier.as_ref() else {
            return;
        };
        if let Err(e) = notifier.announce() {
            self.stats.current.notify_failures += 1;
            if e.kind() == io::ErrorKind::WouldBlock {
                trace!("notification dropped, receiver busy");
            } else {
                warn!(error = %e, "notification send failed");
            }
        }
    }

    /// Tear down every connection. Used on worker exit.
    pub fn shutdown(&mut self) {
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.close(key);
        }
        self.detach_channel();
        debug!(id = self.id, "destroyed ctx");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EVENT_ERR;
    use std::io::Write;
    use std::net::{SocketAddr, TcpListener};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn config() -> ProxyConfig {
        let backend: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut cfg = ProxyConfig::new("127.0.0.1:0".parse().unwrap(), vec![backend]);
        cfg.stats_interval = Duration::from_millis(200);
        cfg
    }

    fn client_conn(ctx: &mut Context) -> (usize, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let key = ctx.add_conn(Socket::from(a), Role::Client).unwrap();
        (key, b)
    }

    #[test]
    fn token_round_trips_key() {
        let token = encode_token(17, 3);
        assert_eq!(decode_token(token), 17);
        assert_ne!(token, encode_token(17, 4));
    }

    #[test]
    fn error_bit_wins_over_read() {
        let mut ctx = Context::new(1, 0, &config()).unwrap();
        let (key, mut peer) = client_conn(&mut ctx);
        peer.write_all(b"\x01\x00\x00\x00z").unwrap();

        let token = ctx.token_of(key).unwrap();
        ctx.dispatch(Ready {
            token,
            events: EVENT_ERR | EVENT_READ,
        });

        assert!(ctx.conn(key).is_none());
        assert_eq!(ctx.stats.current.client_err, 1);
        // the pending bytes were never read
        assert_eq!(ctx.stats.current.requests, 0);
        assert_eq!(ctx.stats.current.request_bytes, 0);
    }

    #[test]
    fn closed_conn_gets_no_write_in_same_event() {
        let mut ctx = Context::new(1, 0, &config()).unwrap();
        let (key, peer) = client_conn(&mut ctx);
        drop(peer);

        let token = ctx.token_of(key).unwrap();
        ctx.dispatch(Ready {
            token,
            events: EVENT_READ | EVENT_WRITE,
        });
        assert!(ctx.conn(key).is_none());
        assert_eq!(ctx.stats.current.client_eof, 1);

        // a second event from the same batch finds nothing
        ctx.dispatch(Ready {
            token,
            events: EVENT_WRITE,
        });
        assert_eq!(ctx.conn_count(), 0);
        assert_eq!(ctx.stats.current.client_eof, 1);
    }

    #[test]
    fn stale_token_for_recycled_slot_is_ignored() {
        let mut ctx = Context::new(1, 0, &config()).unwrap();
        let (key, _peer) = client_conn(&mut ctx);
        let old = ctx.token_of(key).unwrap();
        ctx.close(key);

        let (key2, _peer2) = client_conn(&mut ctx);
        assert_eq!(key, key2);
        ctx.dispatch(Ready {
            token: old,
            events: EVENT_ERR,
        });
        assert!(ctx.conn(key2).is_some());
    }

    #[test]
    fn empty_sweep_resets_to_max_timeout() {
        let mut ctx = Context::new(1, 0, &config()).unwrap();
        assert_eq!(ctx.timeout_sweep(Instant::now()), 0);
        assert_eq!(ctx.poll_timeout(), 200);
    }

    #[test]
    fn sweep_waits_for_future_deadline_capped_at_max() {
        let mut ctx = Context::new(1, 0, &config()).unwrap();
        let now = Instant::now();
        let near = ctx.msgs.alloc(0, Some(now + Duration::from_millis(30)));
        ctx.tmo.insert(now + Duration::from_millis(30), near);

        assert_eq!(ctx.timeout_sweep(now), 0);
        assert_eq!(ctx.poll_timeout(), 30);

        let mut ctx = Context::new(1, 0, &config()).unwrap();
        let far = ctx.msgs.alloc(0, Some(now + Duration::from_secs(60)));
        ctx.tmo.insert(now + Duration::from_secs(60), far);
        ctx.timeout_sweep(now);
        assert_eq!(ctx.poll_timeout(), 200);
    }

    #[test]
    fn settled_requests_are_purged_lazily() {
        let mut ctx = Context::new(1, 0, &config()).unwrap();
        let now = Instant::now();
        let mut keys = Vec::new();
        for i in 0..3u64 {
            let deadline = now - Duration::from_millis(10 - i);
            let k = ctx.msgs.alloc(0, Some(deadline));
            ctx.tmo.insert(deadline, k);
            keys.push(k);
        }
        ctx.msgs.get_mut(keys[0]).unwrap().done = true;
        ctx.msgs.get_mut(keys[1]).unwrap().error = true;
        ctx.msgs.get_mut(keys[2]).unwrap().done = true;

        // all expired, but none is pending: nothing times out
        assert_eq!(ctx.timeout_sweep(now), 0);
        assert_eq!(ctx.pending_timeouts(), 0);
        assert_eq!(ctx.live_requests(), 0);
        assert_eq!(ctx.tmo.purged(), 3);
    }

    #[test]
    fn expired_request_closes_its_backend_with_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut cfg = config();
        cfg.servers = vec![listener.local_addr().unwrap()];
        let mut ctx = Context::new(1, 0, &cfg).unwrap();

        let (client_key, _peer) = client_conn(&mut ctx);
        let server_key = ctx.dial_server(client_key).unwrap();

        let now = Instant::now();
        let deadline = now + Duration::from_millis(5);
        let k = ctx.msgs.alloc(server_key, Some(deadline));
        ctx.tmo.insert(deadline, k);
        ctx.conns[server_key].outstanding.push_back(k);

        assert_eq!(ctx.timeout_sweep(now + Duration::from_millis(10)), 1);
        assert!(ctx.conn(server_key).is_none());
        assert!(ctx.conn(client_key).is_none());
        assert_eq!(ctx.pending_timeouts(), 0);
        assert_eq!(ctx.live_requests(), 0);
        assert_eq!(ctx.stats.current.server_timedout, 1);
        assert_eq!(ctx.poll_timeout(), 200);
    }

    #[test]
    fn expired_request_without_a_backend_is_freed_not_counted() {
        let mut ctx = Context::new(1, 0, &config()).unwrap();
        let (client_key, _peer) = client_conn(&mut ctx);

        let now = Instant::now();
        let deadline = now + Duration::from_millis(5);
        let k = ctx.msgs.alloc(client_key, Some(deadline));
        ctx.tmo.insert(deadline, k);

        assert_eq!(ctx.timeout_sweep(now + Duration::from_millis(10)), 0);
        assert!(ctx.conn(client_key).is_some());
        assert_eq!(ctx.live_requests(), 0);
        assert_eq!(ctx.pending_timeouts(), 0);
        assert_eq!(ctx.stats.current.server_timedout, 0);
    }
}
