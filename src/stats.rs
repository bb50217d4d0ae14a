//! Per-worker statistics.
//!
//! Counters are plain integers: a worker is single-threaded and nothing else
//! touches them. `swap` is called once per loop iteration and publishes a
//! snapshot when the interval has elapsed; with the `metrics` feature the
//! publish also logs a delta report.

use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub client_connections: u64,
    pub client_eof: u64,
    pub client_err: u64,
    pub server_connections: u64,
    pub server_eof: u64,
    pub server_err: u64,
    pub server_timedout: u64,
    pub requests: u64,
    pub request_bytes: u64,
    pub responses: u64,
    pub response_bytes: u64,
    pub accept_failures: u64,
    pub notify_failures: u64,
}

impl StatsSnapshot {
    fn delta(&self, prev: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            client_connections: self.client_connections.saturating_sub(prev.client_connections),
            client_eof: self.client_eof.saturating_sub(prev.client_eof),
            client_err: self.client_err.saturating_sub(prev.client_err),
            server_connections: self.server_connections.saturating_sub(prev.server_connections),
            server_eof: self.server_eof.saturating_sub(prev.server_eof),
            server_err: self.server_err.saturating_sub(prev.server_err),
            server_timedout: self.server_timedout.saturating_sub(prev.server_timedout),
            requests: self.requests.saturating_sub(prev.requests),
            request_bytes: self.request_bytes.saturating_sub(prev.request_bytes),
            responses: self.responses.saturating_sub(prev.responses),
            response_bytes: self.response_bytes.saturating_sub(prev.response_bytes),
            accept_failures: self.accept_failures.saturating_sub(prev.accept_failures),
            notify_failures: self.notify_failures.saturating_sub(prev.notify_failures),
        }
    }
}

#[derive(Debug)]
pub struct Stats {
    pub current: StatsSnapshot,
    published: StatsSnapshot,
    interval: Duration,
    last_publish: Instant,
    generation: u64,
}

impl Stats {
    pub fn create(interval: Duration) -> Self {
        Self {
            current: StatsSnapshot::default(),
            published: StatsSnapshot::default(),
            interval,
            last_publish: Instant::now(),
            generation: 0,
        }
    }

    /// Publish the current counters if the interval has elapsed since the
    /// last publish. Returns the newly published snapshot.
    pub fn swap(&mut self, now: Instant) -> Option<StatsSnapshot> {
        if now.saturating_duration_since(self.last_publish) < self.interval {
            return None;
        }

        let delta = self.current.delta(&self.published);
        self.published = self.current;
        self.last_publish = now;
        self.generation += 1;
        report(self.generation, self.interval, &delta);
        Some(self.published)
    }

    pub fn published(&self) -> &StatsSnapshot {
        &self.published
    }

    /// Number of snapshots published so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Final totals, for the worker's exit log.
    pub fn destroy(self) -> StatsSnapshot {
        tracing::debug!(generation = self.generation, "stats destroyed");
        self.current
    }
}

#[cfg(feature = "metrics")]
fn report(generation: u64, interval: Duration, d: &StatsSnapshot) {
    tracing::info!(
        generation,
        interval_ms = interval.as_millis() as u64,
        requests = d.requests,
        responses = d.responses,
        request_bytes = d.request_bytes,
        response_bytes = d.response_bytes,
        client_conns = d.client_connections,
        client_eof = d.client_eof,
        client_err = d.client_err,
        server_conns = d.server_connections,
        server_eof = d.server_eof,
        server_err = d.server_err,
        server_timedout = d.server_timedout,
        accept_failures = d.accept_failures,
        notify_failures = d.notify_failures,
        "stats delta"
    );
}

#[cfg(not(feature = "metrics"))]
fn report(generation: u64, _interval: Duration, d: &StatsSnapshot) {
    tracing::trace!(
        generation,
        requests = d.requests,
        responses = d.responses,
        "stats published"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_waits_for_interval() {
        let mut stats = Stats::create(Duration::from_millis(100));
        let start = stats.last_publish;
        stats.current.requests = 3;

        assert!(stats.swap(start + Duration::from_millis(50)).is_none());
        assert_eq!(stats.published().requests, 0);

        let snap = stats.swap(start + Duration::from_millis(100)).unwrap();
        assert_eq!(snap.requests, 3);
        assert_eq!(stats.generation(), 1);
    }

    #[test]
    fn published_snapshot_is_frozen_until_next_swap() {
        let mut stats = Stats::create(Duration::from_millis(10));
        let start = stats.last_publish;
        stats.current.responses = 1;
        stats.swap(start + Duration::from_millis(10));
        stats.current.responses = 5;

        assert_eq!(stats.published().responses, 1);
        stats.swap(start + Duration::from_millis(20));
        assert_eq!(stats.published().responses, 5);
    }

    #[test]
    fn delta_is_difference_of_cumulative_counters() {
        let prev = StatsSnapshot {
            requests: 4,
            ..Default::default()
        };
        let cur = StatsSnapshot {
            requests: 10,
            ..Default::default()
        };
        assert_eq!(cur.delta(&prev).requests, 6);
    }

    #[test]
    fn destroy_returns_final_totals() {
        let mut stats = Stats::create(Duration::from_secs(1));
        stats.current.server_timedout = 2;
        assert_eq!(stats.destroy().server_timedout, 2);
    }
}
