#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use forkproxy::config::ProxyConfig;
use forkproxy::core::Context;
use forkproxy::protocol::{HEADER_LEN, write_frame};

/// Framed backend on an ephemeral port. `silent` reads requests and never
/// answers them.
pub fn spawn_backend(silent: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { return };
            thread::spawn(move || serve(stream, silent));
        }
    });
    addr
}

fn serve(mut stream: TcpStream, silent: bool) {
    while let Ok(payload) = read_frame(&mut stream) {
        if silent {
            continue;
        }
        if stream.write_all(&frame(&payload)).is_err() {
            return;
        }
    }
}

/// An address nothing listens on.
pub fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    write_frame(&mut buf, payload);
    buf
}

pub fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;
    let mut payload = vec![0u8; u32::from_le_bytes(header) as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// True once the proxy has closed `stream`, by FIN or RST.
pub fn closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut scratch = [0u8; 16];
    match stream.read(&mut scratch) {
        Ok(0) => true,
        Err(e) => e.kind() == io::ErrorKind::ConnectionReset,
        Ok(_) => false,
    }
}

pub fn test_config(backend: SocketAddr) -> ProxyConfig {
    let mut cfg = ProxyConfig::new("127.0.0.1:0".parse().unwrap(), vec![backend]);
    cfg.stats_interval = Duration::from_millis(50);
    cfg.server_timeout = Some(Duration::from_millis(500));
    cfg
}

/// Run loop iterations until `done` holds. Panics after `limit`.
pub fn drive(ctx: &mut Context, limit: Duration, mut done: impl FnMut(&Context) -> bool) {
    let start = Instant::now();
    while !done(&*ctx) {
        assert!(start.elapsed() < limit, "condition not reached within {limit:?}");
        ctx.run_once().unwrap();
    }
}
