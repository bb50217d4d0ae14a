//! Backend server pool.
//!
//! Selection is plain round-robin; smarter distribution belongs to whatever
//! replaces `select`. Dialing is non-blocking: the returned socket is usually
//! still connecting, and the result is read from `SO_ERROR` once it turns
//! writable.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

#[derive(Debug, Clone)]
pub struct ServerPool {
    servers: Vec<SocketAddr>,
    cursor: usize,
}

impl ServerPool {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self { servers, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn select(&mut self) -> Option<SocketAddr> {
        if self.servers.is_empty() {
            return None;
        }
        let addr = self.servers[self.cursor % self.servers.len()];
        self.cursor = self.cursor.wrapping_add(1);
        Some(addr)
    }
}

/// Start a non-blocking TCP connect. Returns the socket and whether the
/// connect is still in progress.
pub fn dial(addr: SocketAddr) -> io::Result<(Socket, bool)> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => Ok((socket, false)),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok((socket, true)),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn select_cycles_through_servers() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        let mut pool = ServerPool::new(vec![a, b]);
        assert_eq!(pool.select(), Some(a));
        assert_eq!(pool.select(), Some(b));
        assert_eq!(pool.select(), Some(a));
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let mut pool = ServerPool::new(Vec::new());
        assert!(pool.is_empty());
        assert_eq!(pool.select(), None);
    }

    #[test]
    fn dial_reaches_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (socket, _in_progress) = dial(listener.local_addr().unwrap()).unwrap();
        let (_accepted, _) = listener.accept().unwrap();
        assert!(socket.take_error().unwrap().is_none());
    }
}
