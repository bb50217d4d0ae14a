//! Forked workers behind a real listener.

mod common;

use std::io::Write;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use forkproxy::error::SetupError;
use forkproxy::pool::WorkerPool;

use common::*;

#[test]
fn invalid_config_forks_nothing() {
    let mut cfg = test_config(dead_addr());
    cfg.workers = 0;
    assert!(matches!(WorkerPool::init(cfg), Err(SetupError::Config(_))));
}

#[test]
fn pool_forwards_times_out_and_shuts_down() {
    let mut cfg = test_config(spawn_backend(true));
    cfg.workers = 2;
    cfg.server_timeout = Some(Duration::from_millis(50));
    let mut pool = WorkerPool::init(cfg).unwrap();
    assert_eq!(pool.alive_workers(), 2);

    let mut client = TcpStream::connect(pool.listen_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    let sent = Instant::now();
    client.write_all(&frame(b"stall")).unwrap();
    assert!(closed_by_peer(&mut client));
    assert!(sent.elapsed() >= Duration::from_millis(40));

    // every worker publishes its request count under its slot
    let start = Instant::now();
    loop {
        pool.serve_once(20).unwrap();
        let table = pool.coordinator().unwrap().table();
        if table.get(0).is_some() && table.get(1).is_some() {
            let total = table.get(0).unwrap() + table.get(1).unwrap();
            if total == 1 {
                break;
            }
        }
        assert!(start.elapsed() < Duration::from_secs(3), "stats never published");
    }

    pool.shutdown();
    assert_eq!(pool.alive_workers(), 0);
}

#[test]
fn pool_echoes_through_workers() {
    let mut cfg = test_config(spawn_backend(false));
    cfg.workers = 2;
    let mut pool = WorkerPool::init(cfg).unwrap();

    for round in 0..4u8 {
        let mut client = TcpStream::connect(pool.listen_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        client.write_all(&frame(&[round; 3])).unwrap();
        assert_eq!(read_frame(&mut client).unwrap(), vec![round; 3]);
    }

    pool.shutdown();
    assert_eq!(pool.alive_workers(), 0);
}
