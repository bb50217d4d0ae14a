//! Role strategies behind `Context::recv`, `send` and `close`.
//!
//! - listener (`Role::Proxy`): accept clients, dial one backend per client
//! - client: split input into request frames, queue them on the backend and
//!   index each in the timeout queue
//! - server: match response frames to the oldest outstanding requests and
//!   hand the bytes to the client
//!
//! Strategies never close the connection they are servicing; they mark it
//! `done` or return an error and let the dispatch loop close it. They may
//! close its peer.
//!
//! A client that half-closes stays open until the replies to everything it
//! sent have been written back.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::config::LISTEN_BACKLOG;
use crate::conn::{Connection, Role};
use crate::core::Context;
use crate::error::SetupError;
use crate::protocol;
use crate::server;

/// Bind the shared listening socket. Workers inherit it across fork.
pub fn create_listener(addr: SocketAddr) -> Result<Socket, SetupError> {
    let listen_err = |source: io::Error| SetupError::Listen { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(listen_err)?;
    socket.set_reuse_address(true).map_err(listen_err)?;
    socket.set_reuse_port(true).map_err(listen_err)?;
    socket.set_nonblocking(true).map_err(listen_err)?;
    socket.set_nodelay(true).map_err(listen_err)?;
    socket.bind(&addr.into()).map_err(listen_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(listen_err)?;
    Ok(socket)
}

fn protocol_error(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl Context {
    pub(crate) fn proxy_accept(&mut self, key: usize) -> io::Result<()> {
        loop {
            let (sock, addr) = match self.conns[key].sock.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::ECONNABORTED) => continue,
                Err(e) if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) => {
                    warn!(error = %e, "accept on p failed, out of descriptors");
                    self.stats.current.accept_failures += 1;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let prepared = sock.set_nonblocking(true).and_then(|_| sock.set_nodelay(true));
            if let Err(e) = prepared {
                warn!(error = %e, "prepare accepted socket failed");
                self.stats.current.accept_failures += 1;
                continue;
            }

            let client = match self.add_conn(sock, Role::Client) {
                Ok(k) => k,
                Err(e) => {
                    warn!(error = %e, "event add client failed");
                    self.stats.current.accept_failures += 1;
                    continue;
                }
            };
            self.stats.current.client_connections += 1;
            debug!(
                fd = self.conns[client].fd(),
                peer = ?addr.as_socket(),
                "accepted c"
            );

            if let Err(e) = self.dial_server(client) {
                warn!(error = %e, "backend dial failed");
                if let Some(conn) = self.conns.get_mut(client) {
                    conn.err = Some(e.raw_os_error().unwrap_or(libc::ECONNREFUSED));
                }
                self.close(client);
            }
        }
    }

    /// Open the backend connection for `client` and pair the two.
    pub fn dial_server(&mut self, client: usize) -> io::Result<usize> {
        let addr = self
            .servers
            .select()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no backend servers"))?;
        let (sock, in_progress) = server::dial(addr)?;

        let mut conn = Connection::new(sock, Role::Server, Some(addr));
        conn.connecting = in_progress;
        conn.peer = Some(client);
        let key = self.insert_conn(conn)?;
        self.conns[client].peer = Some(key);
        self.stats.current.server_connections += 1;
        debug!(fd = self.conns[key].fd(), %addr, in_progress, "connecting s");
        Ok(key)
    }

    pub(crate) fn client_recv(&mut self, key: usize) -> io::Result<()> {
        let conn = &mut self.conns[key];
        conn.fill()?;
        let (consumed, frames) = protocol::scan_frames(&conn.in_buf).map_err(protocol_error)?;
        let eof = conn.eof;
        let peer = conn.peer;

        if frames > 0 {
            let server = peer
                .filter(|&p| self.conns.get(p).is_some_and(|s| s.peer == Some(key)))
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
            self.forward_requests(key, server, consumed, frames);
        }

        if eof {
            self.settle_client(key);
        }
        Ok(())
    }

    /// A client that stopped sending is done once its backend owes it nothing
    /// and every reply has left.
    fn settle_client(&mut self, key: usize) {
        let Some(conn) = self.conns.get(key) else {
            return;
        };
        if !conn.eof || conn.has_pending_output() {
            return;
        }
        let awaiting = conn
            .peer
            .and_then(|p| self.conns.get(p))
            .is_some_and(|s| s.peer == Some(key) && !s.outstanding.is_empty());
        if !awaiting {
            self.conns[key].done = true;
        }
    }

    fn forward_requests(&mut self, client: usize, server: usize, consumed: usize, frames: usize) {
        let deadline = self.server_timeout.map(|t| Instant::now() + t);

        let Some((c, s)) = self.conns.get2_mut(client, server) else {
            return;
        };
        s.out_buf.extend(c.in_buf.drain(..consumed));

        for _ in 0..frames {
            let k = self.msgs.alloc(server, deadline);
            if let Some(d) = deadline {
                self.tmo.insert(d, k);
            }
            s.outstanding.push_back(k);
        }

        self.stats.current.requests += frames as u64;
        self.stats.current.request_bytes += consumed as u64;
        self.sync_interest(server);
    }

    pub(crate) fn server_recv(&mut self, key: usize) -> io::Result<()> {
        let conn = &mut self.conns[key];
        conn.connecting = false;
        conn.fill()?;
        let (consumed, frames) = protocol::scan_frames(&conn.in_buf).map_err(protocol_error)?;
        if frames > conn.outstanding.len() {
            return Err(protocol_error("response without outstanding request"));
        }

        for _ in 0..frames {
            let Some(k) = conn.outstanding.pop_front() else {
                break;
            };
            let Some(msg) = self.msgs.get_mut(k) else {
                continue;
            };
            msg.done = true;
            // undated requests are not in the timeout queue, nothing will purge them
            if msg.deadline.is_none() {
                self.msgs.free(k);
            }
        }

        let eof = conn.eof;
        let peer = conn.peer;
        if consumed > 0 {
            let handed = match peer.and_then(|p| self.conns.get2_mut(key, p)) {
                Some((s, c)) if c.peer == Some(key) => {
                    c.out_buf.extend(s.in_buf.drain(..consumed));
                    true
                }
                _ => false,
            };
            if !handed {
                self.conns[key].in_buf.drain(..consumed);
            }
            self.stats.current.responses += frames as u64;
            self.stats.current.response_bytes += consumed as u64;
            if let Some(p) = peer {
                self.sync_interest(p);
            }
        }

        if eof {
            self.conns[key].done = true;
        }
        Ok(())
    }

    pub(crate) fn conn_send(&mut self, key: usize) -> io::Result<()> {
        let conn = &mut self.conns[key];
        if conn.role == Role::Proxy {
            return Ok(());
        }
        if conn.connecting {
            if let Some(e) = conn.take_socket_error()? {
                return Err(e);
            }
            conn.connecting = false;
            debug!(fd = conn.fd(), addr = %conn.describe(), "connected s");
        }
        conn.flush()?;
        if conn.role == Role::Client {
            self.settle_client(key);
        }
        Ok(())
    }

    pub(crate) fn proxy_close(&mut self, _key: usize, conn: Connection) {
        debug!(fd = conn.fd(), addr = %conn.describe(), "listener closed");
    }

    pub(crate) fn client_close(&mut self, key: usize, conn: Connection) {
        if conn.err.is_some() {
            self.stats.current.client_err += 1;
        } else if conn.eof {
            self.stats.current.client_eof += 1;
        }

        if let Some(p) = conn.peer {
            if self.conns.get(p).is_some_and(|s| s.peer == Some(key)) {
                self.close(p);
            }
        }
    }

    pub(crate) fn server_close(&mut self, key: usize, conn: Connection) {
        if conn.err.is_some() {
            self.stats.current.server_err += 1;
        } else if conn.eof {
            self.stats.current.server_eof += 1;
        }

        for k in conn.outstanding {
            if let Some(msg) = self.msgs.get_mut(k) {
                msg.error = true;
                if let Some(d) = msg.deadline {
                    self.tmo.remove(d, k);
                }
            }
            self.msgs.free(k);
        }

        let Some(p) = conn.peer else {
            return;
        };
        let Some(client) = self.conns.get_mut(p) else {
            return;
        };
        if client.peer != Some(key) {
            return;
        }
        // responses already handed over still get a chance to leave
        if let Err(e) = client.flush() {
            debug!(fd = client.fd(), error = %e, "flush before close failed");
        }
        client.err = client.err.or(conn.err);
        self.close(p);
    }
}
