//! Per-socket connection state.
//!
//! A `Connection` owns its socket; dropping it closes the descriptor. Buffered
//! I/O here is role-agnostic and never blocks: reads stop at `WouldBlock` or
//! EOF, writes stop at `WouldBlock` and keep the unsent tail for next time.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use socket2::Socket;

use crate::config::READ_CHUNK_SIZE;
use crate::event::{EVENT_READ, EVENT_WRITE};
use crate::msg::MsgKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted client socket.
    Client,
    /// Listening socket.
    Proxy,
    /// Outbound socket to a backend server.
    Server,
}

impl Role {
    pub fn tag(self) -> char {
        match self {
            Role::Client => 'c',
            Role::Proxy => 'p',
            Role::Server => 's',
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

pub struct Connection {
    pub sock: Socket,
    pub role: Role,
    /// Event token: slab key in the low 32 bits, registration serial above.
    pub token: u64,
    pub addr: Option<SocketAddr>,
    /// Paired connection: a client's backend, or a backend's client.
    pub peer: Option<usize>,
    pub in_buf: Vec<u8>,
    pub out_buf: Vec<u8>,
    pub out_pos: usize,
    /// Requests sent on this backend connection, oldest first.
    pub outstanding: VecDeque<MsgKey>,
    pub recv_bytes: usize,
    pub send_bytes: usize,
    /// Last event mask delivered to this connection.
    pub events: u32,
    /// Interest currently registered with the multiplexer.
    pub interest: u32,
    /// errno recorded by the error or timeout path.
    pub err: Option<i32>,
    pub eof: bool,
    pub done: bool,
    /// Non-blocking connect still in progress.
    pub connecting: bool,
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }
}

impl Connection {
    pub fn new(sock: Socket, role: Role, addr: Option<SocketAddr>) -> Self {
        Self {
            sock,
            role,
            token: 0,
            addr,
            peer: None,
            in_buf: Vec::new(),
            out_buf: Vec::new(),
            out_pos: 0,
            outstanding: VecDeque::new(),
            recv_bytes: 0,
            send_bytes: 0,
            events: 0,
            interest: 0,
            err: None,
            eof: false,
            done: false,
            connecting: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Read everything currently available into `in_buf`. Sets `eof` when the
    /// peer has closed its side. Returns bytes read by this call.
    pub fn fill(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            let start = self.in_buf.len();
            self.in_buf.resize(start + READ_CHUNK_SIZE, 0);
            let result = self.sock.read(&mut self.in_buf[start..]);
            self.in_buf.truncate(start + *result.as_ref().unwrap_or(&0));

            match result {
                Ok(0) => {
                    self.eof = true;
                    return Ok(total);
                }
                Ok(n) => {
                    total += n;
                    self.recv_bytes += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much of the pending output as the socket accepts.
    /// Returns bytes written by this call.
    pub fn flush(&mut self) -> io::Result<usize> {
        let mut total = 0;
        while self.out_pos < self.out_buf.len() {
            match self.sock.write(&self.out_buf[self.out_pos..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.out_pos += n;
                    self.send_bytes += n;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.out_buf.clear();
        self.out_pos = 0;
        Ok(total)
    }

    pub fn has_pending_output(&self) -> bool {
        self.out_pos < self.out_buf.len()
    }

    /// Interest this connection should be registered with right now.
    pub fn wanted_interest(&self) -> u32 {
        let mut interest = 0;
        if !self.eof {
            interest |= EVENT_READ;
        }
        if self.role != Role::Proxy && (self.connecting || self.has_pending_output()) {
            interest |= EVENT_WRITE;
        }
        interest
    }

    /// Fetch and clear the pending socket error (`SO_ERROR`).
    pub fn take_socket_error(&self) -> io::Result<Option<io::Error>> {
        self.sock.take_error()
    }

    pub fn describe(&self) -> String {
        match self.addr {
            Some(addr) => addr.to_string(),
            None => "-".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn pair() -> (Connection, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (Connection::new(Socket::from(a), Role::Client, None), b)
    }

    #[test]
    fn fill_reads_available_bytes_without_blocking() {
        let (mut conn, mut peer) = pair();
        assert_eq!(conn.fill().unwrap(), 0);
        assert!(!conn.eof);

        peer.write_all(b"hello").unwrap();
        assert_eq!(conn.fill().unwrap(), 5);
        assert_eq!(conn.in_buf, b"hello");
        assert_eq!(conn.recv_bytes, 5);
    }

    #[test]
    fn fill_marks_eof_when_peer_closes() {
        let (mut conn, mut peer) = pair();
        peer.write_all(b"ab").unwrap();
        drop(peer);
        assert_eq!(conn.fill().unwrap(), 2);
        assert!(conn.eof);
        assert_eq!(conn.wanted_interest() & EVENT_READ, 0);
    }

    #[test]
    fn flush_drains_output_and_resets_cursor() {
        let (mut conn, mut peer) = pair();
        conn.out_buf.extend_from_slice(b"xyz");
        assert_eq!(conn.wanted_interest(), EVENT_READ | EVENT_WRITE);

        assert_eq!(conn.flush().unwrap(), 3);
        assert!(!conn.has_pending_output());
        assert_eq!(conn.send_bytes, 3);
        assert_eq!(conn.wanted_interest(), EVENT_READ);

        let mut got = [0u8; 3];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"xyz");
    }

    #[test]
    fn role_tags_match_log_convention() {
        assert_eq!(Role::Client.tag(), 'c');
        assert_eq!(Role::Proxy.tag(), 'p');
        assert_eq!(Role::Server.tag(), 's');
    }
}
