//! Best-effort worker → coordinator notifications.
//!
//! Datagram socket pair, non-blocking on both ends. Each message is a short
//! text line naming the sender. Nothing depends on delivery: a full socket
//! buffer just drops the message.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixDatagram;

const MAX_NOTE_LEN: usize = 256;

#[derive(Debug)]
pub struct Notifier {
    sock: UnixDatagram,
    slot: usize,
}

#[derive(Debug)]
pub struct NotifyReceiver {
    sock: UnixDatagram,
}

pub fn pair(slot: usize) -> io::Result<(Notifier, NotifyReceiver)> {
    let (tx, rx) = UnixDatagram::pair()?;
    tx.set_nonblocking(true)?;
    rx.set_nonblocking(true)?;
    Ok((Notifier { sock: tx, slot }, NotifyReceiver { sock: rx }))
}

impl Notifier {
    pub fn send(&self, note: &str) -> io::Result<()> {
        self.sock.send(note.as_bytes())?;
        Ok(())
    }

    /// The per-iteration "I am alive" line.
    pub fn announce(&self) -> io::Result<()> {
        self.send(&format!("worker {} pid={}", self.slot, std::process::id()))
    }
}

impl AsFd for NotifyReceiver {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }
}

impl NotifyReceiver {
    /// Read every queued note. Stops at the first would-block.
    pub fn drain(&self, out: &mut Vec<String>) -> io::Result<usize> {
        let mut buf = [0u8; MAX_NOTE_LEN];
        let mut n = 0;
        loop {
            match self.sock.recv(&mut buf) {
                Ok(len) => {
                    out.push(String::from_utf8_lossy(&buf[..len]).into_owned());
                    n += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_names_slot_and_pid() {
        let (tx, rx) = pair(3).unwrap();
        tx.announce().unwrap();

        let mut notes = Vec::new();
        assert_eq!(rx.drain(&mut notes).unwrap(), 1);
        assert_eq!(notes[0], format!("worker 3 pid={}", std::process::id()));
    }

    #[test]
    fn send_fails_without_blocking_once_receiver_is_gone() {
        let (tx, rx) = pair(0).unwrap();
        drop(rx);
        assert!(tx.send("x").is_err());
    }

    #[test]
    fn drain_on_empty_socket_returns_zero() {
        let (_tx, rx) = pair(0).unwrap();
        let mut notes = Vec::new();
        assert_eq!(rx.drain(&mut notes).unwrap(), 0);
    }
}
