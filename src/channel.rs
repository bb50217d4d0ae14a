//! Coordination channel between a worker and the table coordinator.
//!
//! The transport is a non-blocking Unix stream socket pair, so records arrive
//! in arbitrary fragments. Every record is exactly `RECORD_SIZE` bytes:
//!
//! ```text
//! [u8 kind][u32 LE key][i32 LE value]
//! kind: 0 = GET, 1 = PUT, 2 = REPLY
//! ```
//!
//! A REPLY carrying `NOT_FOUND` means the key is absent. That value is
//! reserved and can never be stored.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};

use crate::config::{MAX_CHANNEL_BACKLOG, duration_to_ms};
use crate::error::ChannelError;

pub const RECORD_SIZE: usize = 9;
pub const NOT_FOUND: i32 = i32::MIN;

const KIND_GET: u8 = 0;
const KIND_PUT: u8 = 1;
const KIND_REPLY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Get { key: u32 },
    Put { key: u32, value: i32 },
    /// `None` is the not-found reply.
    Reply { key: u32, value: Option<i32> },
}

/// Wire image of one record. All fields are byte arrays so the layout has no
/// padding and alignment 1.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawCommand {
    kind: u8,
    key: [u8; 4],
    value: [u8; 4],
}

// SAFETY: only u8 and [u8; N] fields, no padding, every bit pattern valid.
unsafe impl Zeroable for RawCommand {}
unsafe impl Pod for RawCommand {}

const _: () = assert!(std::mem::size_of::<RawCommand>() == RECORD_SIZE);

impl Command {
    pub fn key(&self) -> u32 {
        match *self {
            Command::Get { key } | Command::Put { key, .. } | Command::Reply { key, .. } => key,
        }
    }

    pub fn encode(&self) -> Result<[u8; RECORD_SIZE], ChannelError> {
        let (kind, key, value) = match *self {
            Command::Get { key } => (KIND_GET, key, 0),
            Command::Put { key, value } => {
                if value == NOT_FOUND {
                    return Err(ChannelError::ReservedValue(value));
                }
                (KIND_PUT, key, value)
            }
            Command::Reply { key, value } => (KIND_REPLY, key, value.unwrap_or(NOT_FOUND)),
        };
        let raw = RawCommand {
            kind,
            key: key.to_le_bytes(),
            value: value.to_le_bytes(),
        };
        let mut out = [0u8; RECORD_SIZE];
        out.copy_from_slice(bytemuck::bytes_of(&raw));
        Ok(out)
    }

    pub fn decode(record: &[u8; RECORD_SIZE]) -> Result<Command, ChannelError> {
        let raw: RawCommand = bytemuck::pod_read_unaligned(record);
        let key = u32::from_le_bytes(raw.key);
        let value = i32::from_le_bytes(raw.value);
        match raw.kind {
            KIND_GET => Ok(Command::Get { key }),
            KIND_PUT => Ok(Command::Put { key, value }),
            KIND_REPLY => Ok(Command::Reply {
                key,
                value: (value != NOT_FOUND).then_some(value),
            }),
            other => Err(ChannelError::UnknownKind(other)),
        }
    }
}

/// Reassembles whole records from a byte stream.
#[derive(Debug, Default)]
pub struct RecordReader {
    buf: Vec<u8>,
}

impl RecordReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held that do not yet form a full record.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_command(&mut self) -> Result<Option<Command>, ChannelError> {
        if self.buf.len() < RECORD_SIZE {
            return Ok(None);
        }
        let mut record = [0u8; RECORD_SIZE];
        record.copy_from_slice(&self.buf[..RECORD_SIZE]);
        self.buf.drain(..RECORD_SIZE);
        Command::decode(&record).map(Some)
    }
}

/// One end of a coordination channel.
#[derive(Debug)]
pub struct ChannelEndpoint {
    stream: UnixStream,
    reader: RecordReader,
    out: Vec<u8>,
    out_pos: usize,
    eof: bool,
    /// Replies still due for requests whose caller stopped waiting: PUTs sent
    /// with `put_async` and round-trips that failed after sending.
    owed_replies: usize,
    timeout: Duration,
}

impl AsFd for ChannelEndpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl ChannelEndpoint {
    /// `timeout` bounds every synchronous round-trip made through this end.
    pub fn pair(timeout: Duration) -> io::Result<(ChannelEndpoint, ChannelEndpoint)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a, timeout)?, Self::new(b, timeout)?))
    }

    pub fn new(stream: UnixStream, timeout: Duration) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            reader: RecordReader::new(),
            out: Vec::new(),
            out_pos: 0,
            eof: false,
            owed_replies: 0,
            timeout,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn has_pending_output(&self) -> bool {
        self.out_pos < self.out.len()
    }

    /// Whole records queued but not yet written to the socket.
    pub fn pending_records(&self) -> usize {
        (self.out.len() - self.out_pos) / RECORD_SIZE
    }

    pub fn owed_replies(&self) -> usize {
        self.owed_replies
    }

    /// Bound for synchronous round-trips made after this call.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Queue a record and push out whatever the socket takes without blocking.
    /// Refused with `Backlog` once `MAX_CHANNEL_BACKLOG` records are waiting.
    pub fn send(&mut self, cmd: Command) -> Result<(), ChannelError> {
        self.enqueue(cmd)?;
        self.flush()?;
        Ok(())
    }

    /// On error nothing was queued.
    fn enqueue(&mut self, cmd: Command) -> Result<(), ChannelError> {
        let record = cmd.encode()?;
        if self.out_pos > 0 {
            self.out.drain(..self.out_pos);
            self.out_pos = 0;
        }
        if self.pending_records() >= MAX_CHANNEL_BACKLOG {
            return Err(ChannelError::Backlog(MAX_CHANNEL_BACKLOG));
        }
        self.out.extend_from_slice(&record);
        Ok(())
    }

    /// Returns true once nothing is left queued.
    pub fn flush(&mut self) -> Result<bool, ChannelError> {
        while self.out_pos < self.out.len() {
            match self.stream.write(&self.out[self.out_pos..]) {
                Ok(0) => return Err(ChannelError::Closed),
                Ok(n) => self.out_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Err(ChannelError::Closed),
                Err(e) => return Err(e.into()),
            }
        }
        self.out.clear();
        self.out_pos = 0;
        Ok(true)
    }

    fn fill(&mut self) -> Result<(), ChannelError> {
        let mut chunk = [0u8; 64 * RECORD_SIZE];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => self.reader.push(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Next complete record, if one is available without blocking.
    pub fn recv(&mut self) -> Result<Option<Command>, ChannelError> {
        if let Some(cmd) = self.reader.next_command()? {
            return Ok(Some(cmd));
        }
        if !self.eof {
            self.fill()?;
            if let Some(cmd) = self.reader.next_command()? {
                return Ok(Some(cmd));
            }
        }
        if self.eof {
            return Err(ChannelError::Closed);
        }
        Ok(None)
    }

    /// Fire-and-forget PUT. Its reply is consumed later by `drain_replies` or
    /// skipped by the next synchronous call.
    pub fn put_async(&mut self, key: u32, value: i32) -> Result<(), ChannelError> {
        self.send(Command::Put { key, value })?;
        self.owed_replies += 1;
        Ok(())
    }

    /// Consume replies owed to earlier `put_async` calls. Returns how many.
    pub fn drain_replies(&mut self) -> Result<usize, ChannelError> {
        let mut drained = 0;
        while let Some(cmd) = self.recv()? {
            match cmd {
                Command::Reply { key, value } => {
                    self.owed_replies = self.owed_replies.saturating_sub(1);
                    drained += 1;
                    tracing::trace!(key, ?value, "async put acknowledged");
                }
                other => tracing::warn!(?other, "unexpected command on worker channel"),
            }
        }
        Ok(drained)
    }

    /// Look `key` up in the coordinator's table. Blocks up to the channel
    /// timeout; a silent or dead coordinator yields `Timeout` or `Closed`.
    pub fn remote_get(&mut self, key: u32) -> Result<Option<i32>, ChannelError> {
        self.round_trip(Command::Get { key })
    }

    /// Store `value` under `key` and wait for the coordinator's reply.
    pub fn remote_put(&mut self, key: u32, value: i32) -> Result<Option<i32>, ChannelError> {
        self.round_trip(Command::Put { key, value })
    }

    fn round_trip(&mut self, cmd: Command) -> Result<Option<i32>, ChannelError> {
        let deadline = Instant::now() + self.timeout;
        self.enqueue(cmd)?;

        // once queued, a reply may still come after we give up on it
        let result = self.await_reply(cmd.key(), deadline);
        if result.is_err() {
            self.owed_replies += 1;
        }
        result
    }

    fn await_reply(&mut self, want: u32, deadline: Instant) -> Result<Option<i32>, ChannelError> {
        while !self.flush()? {
            self.wait_ready(libc::POLLOUT, deadline)?;
        }

        loop {
            match self.recv()? {
                Some(Command::Reply { key, value }) => {
                    if self.owed_replies > 0 {
                        self.owed_replies -= 1;
                        continue;
                    }
                    if key != want {
                        return Err(ChannelError::KeyMismatch { want, got: key });
                    }
                    return Ok(value);
                }
                Some(other) => tracing::warn!(?other, "unexpected command on worker channel"),
                None => self.wait_ready(libc::POLLIN, deadline)?,
            }
        }
    }

    fn wait_ready(&self, events: libc::c_short, deadline: Instant) -> Result<(), ChannelError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ChannelError::Timeout(self.timeout.as_millis() as u64));
        }
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, duration_to_ms(remaining)) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err.into());
        }
        if rc == 0 {
            return Err(ChannelError::Timeout(self.timeout.as_millis() as u64));
        }
        Ok(())
    }
}
