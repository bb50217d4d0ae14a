//! Readiness multiplexer: a thin level-triggered wrapper over `nix`'s epoll.
//!
//! Each worker creates its own instance after fork, so no epoll descriptor is
//! ever shared between processes. Registrations carry an opaque `u64` token
//! that comes back verbatim with every ready event.

use std::io;
use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::sys::epoll::{self, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

pub const EVENT_READ: u32 = EpollFlags::EPOLLIN.bits() as u32;
pub const EVENT_WRITE: u32 = EpollFlags::EPOLLOUT.bits() as u32;
pub const EVENT_ERR: u32 = EpollFlags::EPOLLERR.bits() as u32;
pub const EVENT_HUP: u32 = EpollFlags::EPOLLHUP.bits() as u32;

/// One entry of a wait result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub token: u64,
    pub events: u32,
}

impl Ready {
    pub fn is_error(&self) -> bool {
        self.events & EVENT_ERR != 0
    }

    /// Peer hangup is serviced on the read path so EOF is observed by recv.
    pub fn is_readable(&self) -> bool {
        self.events & (EVENT_READ | EVENT_HUP) != 0
    }

    pub fn is_writable(&self) -> bool {
        self.events & EVENT_WRITE != 0
    }
}

fn interest_event(token: u64, interest: u32) -> EpollEvent {
    EpollEvent::new(EpollFlags::from_bits_truncate(interest as i32), token)
}

pub struct Epoll {
    ep: epoll::Epoll,
    events: Vec<EpollEvent>,
}

impl Epoll {
    /// `nevent` bounds how many ready descriptors a single wait reports.
    pub fn new(nevent: usize) -> io::Result<Self> {
        let ep = epoll::Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            ep,
            events: vec![EpollEvent::empty(); nevent.max(1)],
        })
    }

    pub fn add(&self, fd: impl AsFd, token: u64, interest: u32) -> io::Result<()> {
        self.ep.add(fd, interest_event(token, interest))?;
        Ok(())
    }

    pub fn modify(&self, fd: impl AsFd, token: u64, interest: u32) -> io::Result<()> {
        self.ep.modify(fd, &mut interest_event(token, interest))?;
        Ok(())
    }

    pub fn delete(&self, fd: impl AsFd) -> io::Result<()> {
        self.ep.delete(fd)?;
        Ok(())
    }

    /// Block for up to `timeout_ms` (-1 waits forever) and append ready events
    /// to `out` in the order the kernel reported them.
    ///
    /// An interrupted wait reports zero events rather than an error.
    pub fn wait(&mut self, timeout_ms: i32, out: &mut Vec<Ready>) -> io::Result<usize> {
        out.clear();
        let timeout = EpollTimeout::try_from(timeout_ms).unwrap_or(EpollTimeout::NONE);
        let n = match self.ep.wait(&mut self.events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        out.extend(self.events[..n].iter().map(|ev| Ready {
            token: ev.data(),
            events: ev.events().bits() as u32,
        }));
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn wait_times_out_with_no_events() {
        let mut ep = Epoll::new(8).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        ep.add(&a, 7, EVENT_READ).unwrap();

        let mut out = Vec::new();
        assert_eq!(ep.wait(10, &mut out).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn readable_socket_reports_its_token() {
        let mut ep = Epoll::new(8).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        ep.add(&a, 42, EVENT_READ).unwrap();
        b.write_all(b"x").unwrap();

        let mut out = Vec::new();
        assert_eq!(ep.wait(1000, &mut out).unwrap(), 1);
        assert_eq!(out[0].token, 42);
        assert!(out[0].is_readable());
        assert!(!out[0].is_error());
    }

    #[test]
    fn deleted_descriptor_is_not_reported() {
        let mut ep = Epoll::new(8).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        ep.add(&a, 1, EVENT_READ).unwrap();
        ep.delete(&a).unwrap();
        b.write_all(b"x").unwrap();

        let mut out = Vec::new();
        assert_eq!(ep.wait(10, &mut out).unwrap(), 0);
        assert!(ep.delete(&a).is_err());
    }

    #[test]
    fn modify_switches_interest_to_write() {
        let mut ep = Epoll::new(8).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        ep.add(&a, 3, EVENT_READ).unwrap();

        let mut out = Vec::new();
        assert_eq!(ep.wait(10, &mut out).unwrap(), 0);

        ep.modify(&a, 3, EVENT_READ | EVENT_WRITE).unwrap();
        assert_eq!(ep.wait(1000, &mut out).unwrap(), 1);
        assert!(out[0].is_writable());
        assert!(!out[0].is_readable());
    }

    #[test]
    fn negative_timeout_below_forever_is_treated_as_forever() {
        let mut ep = Epoll::new(8).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        ep.add(&a, 9, EVENT_READ).unwrap();
        b.write_all(b"x").unwrap();

        let mut out = Vec::new();
        assert_eq!(ep.wait(-5, &mut out).unwrap(), 1);
        assert_eq!(out[0].token, 9);
    }

    #[test]
    fn hangup_counts_as_readable() {
        let ready = Ready {
            token: 0,
            events: EVENT_HUP,
        };
        assert!(ready.is_readable());
        assert!(!ready.is_writable());
    }
}
