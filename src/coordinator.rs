//! Shared table coordinator.
//!
//! The key → value table lives only here. Workers reach it through their
//! coordination channel; every GET or PUT read from a channel is applied in
//! arrival order and answered with a REPLY on the same channel.

use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd};

use slab::Slab;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelEndpoint, Command, NOT_FOUND};
use crate::config::EVENT_BATCH_SIZE;
use crate::error::{ChannelError, LoopError, SetupError};
use crate::event::{EVENT_READ, EVENT_WRITE, Epoll, Ready};
use crate::notify::NotifyReceiver;

#[derive(Debug, Default)]
pub struct SharedTable {
    entries: HashMap<u32, i32>,
}

impl SharedTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: u32) -> Option<i32> {
        self.entries.get(&key).copied()
    }

    /// Create or overwrite. Returns the previous value.
    pub fn put(&mut self, key: u32, value: i32) -> Option<i32> {
        self.entries.insert(key, value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply one command and build its reply. Replies arriving here are ignored.
    pub fn apply(&mut self, cmd: Command) -> Option<Command> {
        match cmd {
            Command::Get { key } => Some(Command::Reply {
                key,
                value: self.get(key),
            }),
            Command::Put { key, value } if value == NOT_FOUND => {
                Some(Command::Reply { key, value: None })
            }
            Command::Put { key, value } => {
                self.put(key, value);
                Some(Command::Reply {
                    key,
                    value: Some(value),
                })
            }
            Command::Reply { .. } => None,
        }
    }
}

enum PeerKind {
    Channel(ChannelEndpoint),
    Notes(NotifyReceiver),
}

impl AsFd for PeerKind {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            PeerKind::Channel(ch) => ch.as_fd(),
            PeerKind::Notes(rx) => rx.as_fd(),
        }
    }
}

struct Peer {
    slot: usize,
    kind: PeerKind,
    interest: u32,
}

pub struct Coordinator {
    table: SharedTable,
    epoll: Epoll,
    ready: Vec<Ready>,
    peers: Slab<Peer>,
    notes: Vec<String>,
    served: u64,
}

impl Coordinator {
    pub fn new() -> Result<Self, SetupError> {
        Ok(Self {
            table: SharedTable::new(),
            epoll: Epoll::new(EVENT_BATCH_SIZE).map_err(SetupError::Event)?,
            ready: Vec::with_capacity(EVENT_BATCH_SIZE),
            peers: Slab::new(),
            notes: Vec::new(),
            served: 0,
        })
    }

    pub fn table(&self) -> &SharedTable {
        &self.table
    }

    /// Commands applied so far.
    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn add_channel(&mut self, slot: usize, endpoint: ChannelEndpoint) -> Result<(), SetupError> {
        self.register(slot, PeerKind::Channel(endpoint))
    }

    pub fn add_notes(&mut self, slot: usize, receiver: NotifyReceiver) -> Result<(), SetupError> {
        self.register(slot, PeerKind::Notes(receiver))
    }

    fn register(&mut self, slot: usize, kind: PeerKind) -> Result<(), SetupError> {
        let entry = self.peers.vacant_entry();
        let key = entry.key();
        self.epoll
            .add(kind.as_fd(), key as u64, EVENT_READ)
            .map_err(SetupError::Event)?;
        entry.insert(Peer {
            slot,
            kind,
            interest: EVENT_READ,
        });
        Ok(())
    }

    /// Wait up to `timeout_ms` for channel activity and serve it.
    /// Returns the number of commands applied.
    pub fn serve_once(&mut self, timeout_ms: i32) -> Result<usize, LoopError> {
        let mut ready = std::mem::take(&mut self.ready);
        let result = self.epoll.wait(timeout_ms, &mut ready);
        let mut applied = 0;
        if result.is_ok() {
            for ev in &ready {
                applied += self.service(ev.token as usize, *ev);
            }
        }
        self.ready = ready;
        result.map_err(LoopError::Wait)?;
        Ok(applied)
    }

    fn service(&mut self, key: usize, ev: Ready) -> usize {
        let Some(peer) = self.peers.get_mut(key) else {
            return 0;
        };
        let slot = peer.slot;

        let outcome = match &mut peer.kind {
            PeerKind::Notes(rx) => {
                self.notes.clear();
                let res = rx.drain(&mut self.notes).map_err(ChannelError::from);
                for note in &self.notes {
                    trace!(slot, note = %note, "notification");
                }
                res.map(|_| 0)
            }
            PeerKind::Channel(ch) => Self::serve_channel(&mut self.table, ch, ev),
        };

        match outcome {
            Ok(applied) => {
                self.served += applied as u64;
                self.sync_interest(key);
                applied
            }
            Err(ChannelError::Closed) => {
                info!(slot, "worker channel closed");
                self.remove(key);
                0
            }
            Err(e) => {
                warn!(slot, error = %e, "dropping worker channel");
                self.remove(key);
                0
            }
        }
    }

    fn serve_channel(
        table: &mut SharedTable,
        ch: &mut ChannelEndpoint,
        ev: Ready,
    ) -> Result<usize, ChannelError> {
        if ev.is_writable() {
            ch.flush()?;
        }
        let mut applied = 0;
        if ev.is_readable() || ev.is_error() {
            while let Some(cmd) = ch.recv()? {
                debug!(?cmd, "table command");
                if let Some(reply) = table.apply(cmd) {
                    ch.send(reply)?;
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }

    fn sync_interest(&mut self, key: usize) {
        let Some(peer) = self.peers.get_mut(key) else {
            return;
        };
        let wanted = match &peer.kind {
            PeerKind::Channel(ch) if ch.has_pending_output() => EVENT_READ | EVENT_WRITE,
            _ => EVENT_READ,
        };
        if wanted != peer.interest {
            if let Err(e) = self.epoll.modify(peer.kind.as_fd(), key as u64, wanted) {
                warn!(slot = peer.slot, error = %e, "event mod failed, ignored");
            }
            peer.interest = wanted;
        }
    }

    fn remove(&mut self, key: usize) {
        if let Some(peer) = self.peers.try_remove(key) {
            if let Err(e) = self.epoll.delete(peer.kind.as_fd()) {
                warn!(slot = peer.slot, error = %e, "event del failed, ignored");
            }
        }
    }

    /// Number of channels and note receivers still attached.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
