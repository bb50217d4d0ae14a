use forkproxy::timeout::{Expiry, TimeoutQueue};
use std::collections::HashSet;
use std::env;
use std::hint::black_box;
use std::time::{Duration, Instant};

const ITERATIONS: usize = 2_000_000;

/// Steady state of a busy worker: `live` requests in flight, each answered
/// before its deadline, so every expiry the sweep sees is stale.
fn bench_settled(live: usize) {
    let base = Instant::now();
    let mut queue = TimeoutQueue::new();
    let mut settled = HashSet::with_capacity(live);

    for k in 0..live {
        queue.insert(base + Duration::from_micros(k as u64), k);
    }

    let start = Instant::now();
    for i in 0..ITERATIONS {
        let k = i % live;
        settled.insert(k);
        let now = base + Duration::from_micros(i as u64);
        match queue.next_expired(now, |k| settled.remove(&k)) {
            Expiry::Expired(k) => {
                black_box(k);
            }
            other => {
                black_box(other);
            }
        }
        queue.insert(now + Duration::from_micros(live as u64), live + i);
    }
    let elapsed = start.elapsed();

    eprintln!(
        "  {:>7} live: {:>8.1} ns/op, {} purged, {} left",
        live,
        elapsed.as_nanos() as f64 / ITERATIONS as f64,
        queue.purged(),
        queue.len()
    );
}

/// Insert then cancel: what a backend close does to its outstanding requests.
fn bench_insert_remove(live: usize) {
    let base = Instant::now();
    let mut queue = TimeoutQueue::new();
    for k in 0..live {
        queue.insert(base + Duration::from_micros(k as u64), k);
    }

    let start = Instant::now();
    for i in 0..ITERATIONS {
        let deadline = base + Duration::from_micros((i % live) as u64);
        let k = live + i;
        queue.insert(deadline, k);
        black_box(queue.remove(deadline, k));
    }
    let elapsed = start.elapsed();

    eprintln!(
        "  {:>7} live: {:>8.1} ns/op",
        live,
        elapsed.as_nanos() as f64 / ITERATIONS as f64
    );
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let sizes = [16, 256, 4096, 65536];

    if args.len() > 1 && args[1] == "--insert-remove" {
        eprintln!("Timeout queue insert + remove ({} ops)\n", ITERATIONS);
        for live in sizes {
            bench_insert_remove(live);
        }
    } else {
        eprintln!("Timeout queue sweep with lazy purge ({} ops)\n", ITERATIONS);
        for live in sizes {
            bench_settled(live);
        }
    }
}
