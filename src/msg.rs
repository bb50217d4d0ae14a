//! In-flight requests.
//!
//! A request lives in the worker's `MsgTable` from the moment a complete frame
//! is forwarded to a backend until it is purged from the timeout queue (or,
//! for requests without a deadline, until its response arrives or its backend
//! closes). `owner` is a plain slab key, not a reference.

use std::time::Instant;

use slab::Slab;

pub type MsgKey = usize;

#[derive(Debug)]
pub struct Msg {
    pub id: u64,
    /// Slab key of the backend connection the request was sent on.
    pub owner: usize,
    pub deadline: Option<Instant>,
    pub done: bool,
    pub error: bool,
}

impl Msg {
    /// Done or errored requests are skipped by the timeout sweep.
    pub fn is_settled(&self) -> bool {
        self.done || self.error
    }
}

#[derive(Debug, Default)]
pub struct MsgTable {
    msgs: Slab<Msg>,
    next_id: u64,
}

impl MsgTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, owner: usize, deadline: Option<Instant>) -> MsgKey {
        self.next_id += 1;
        self.msgs.insert(Msg {
            id: self.next_id,
            owner,
            deadline,
            done: false,
            error: false,
        })
    }

    pub fn get(&self, key: MsgKey) -> Option<&Msg> {
        self.msgs.get(key)
    }

    pub fn get_mut(&mut self, key: MsgKey) -> Option<&mut Msg> {
        self.msgs.get_mut(key)
    }

    pub fn free(&mut self, key: MsgKey) -> Option<Msg> {
        self.msgs.try_remove(key)
    }

    /// Missing keys count as settled: a freed request must never look pending.
    pub fn is_settled(&self, key: MsgKey) -> bool {
        self.msgs.get(key).is_none_or(Msg::is_settled)
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_across_reused_slots() {
        let mut table = MsgTable::new();
        let a = table.alloc(0, None);
        let first_id = table.get(a).unwrap().id;
        table.free(a);
        let b = table.alloc(0, None);
        assert_eq!(a, b);
        assert!(table.get(b).unwrap().id > first_id);
    }

    #[test]
    fn settled_tracks_done_error_and_missing() {
        let mut table = MsgTable::new();
        let k = table.alloc(3, None);
        assert!(!table.is_settled(k));

        table.get_mut(k).unwrap().done = true;
        assert!(table.is_settled(k));

        table.get_mut(k).unwrap().done = false;
        table.get_mut(k).unwrap().error = true;
        assert!(table.is_settled(k));

        table.free(k);
        assert!(table.is_settled(k));
        assert!(table.is_empty());
    }
}
