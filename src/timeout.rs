//! Timeout queue: pending requests ordered by absolute deadline.
//!
//! Entries are `(deadline, key)` pairs in an ordered set, so insert, remove and
//! peek-minimum are all logarithmic. Ties on the deadline are broken by key,
//! which keeps every entry distinct.
//!
//! Requests that finish or fail are not removed eagerly. The queue is told
//! which keys went stale when it next scans for the minimum, and drops them
//! there (see [`TimeoutQueue::next_expired`]).

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Outcome of scanning for the soonest live deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry<K> {
    /// Nothing pending.
    Idle,
    /// The soonest live deadline is this far in the future.
    Wait(Duration),
    /// This entry's deadline has passed. It has already been removed.
    Expired(K),
}

#[derive(Debug)]
pub struct TimeoutQueue<K> {
    entries: BTreeSet<(Instant, K)>,
    purged: u64,
}

impl<K: Ord + Copy> Default for TimeoutQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Copy> TimeoutQueue<K> {
    pub fn new() -> Self {
        Self {
            entries: BTreeSet::new(),
            purged: 0,
        }
    }

    /// Returns false if the exact `(deadline, key)` entry was already present.
    pub fn insert(&mut self, deadline: Instant, key: K) -> bool {
        self.entries.insert((deadline, key))
    }

    /// Callers keep the deadline alongside the key so removal is a direct lookup.
    pub fn remove(&mut self, deadline: Instant, key: K) -> bool {
        let removed = self.entries.remove(&(deadline, key));
        if removed {
            self.purged += 1;
        }
        removed
    }

    pub fn peek_minimum(&self) -> Option<(Instant, K)> {
        self.entries.first().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries removed since creation, eager or lazy.
    pub fn purged(&self) -> u64 {
        self.purged
    }

    /// Walk the queue from the minimum, dropping entries for which `is_stale`
    /// returns true, until a live entry is found or the queue is empty.
    ///
    /// A live entry whose deadline is at or before `now` is removed and
    /// returned as `Expired`. A live entry in the future is left in place and
    /// the remaining wait is reported. Each stale entry is visited once.
    pub fn next_expired(&mut self, now: Instant, mut is_stale: impl FnMut(K) -> bool) -> Expiry<K> {
        loop {
            let Some((deadline, key)) = self.peek_minimum() else {
                return Expiry::Idle;
            };

            if is_stale(key) {
                self.remove(deadline, key);
                continue;
            }

            if now < deadline {
                return Expiry::Wait(deadline - now);
            }

            self.remove(deadline, key);
            return Expiry::Expired(key);
        }
    }
}
