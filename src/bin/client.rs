use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use forkproxy::protocol::{HEADER_LEN, write_frame};

#[derive(Parser)]
#[command(about = "Test client and backend for forkproxy")]
struct Args {
    /// Proxy (or, for `echo`, bind) address
    #[arg(short, long, default_value = "127.0.0.1:22122")]
    addr: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Send pipelined requests through the proxy and verify the echoed replies (default)
    Smoke {
        /// Number of pipelined requests
        #[arg(short, long, default_value_t = 100)]
        requests: usize,
    },
    /// Send one request to a backend that never answers and time the close
    Stall {
        /// Give up after this many ms
        #[arg(short, long, default_value_t = 5_000)]
        limit_ms: u64,
    },
    /// Run a framed echo backend
    Echo {
        /// Read requests but never answer them
        #[arg(long)]
        silent: bool,
    },
}

fn request_payload(i: usize) -> Vec<u8> {
    format!("req-{i:06}").into_bytes()
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

fn main() {
    let args = Args::parse();

    match args.command.unwrap_or(Command::Smoke { requests: 100 }) {
        Command::Smoke { requests } => smoke_test(&args.addr, requests),
        Command::Stall { limit_ms } => stall_test(&args.addr, limit_ms),
        Command::Echo { silent } => echo_backend(&args.addr, silent),
    }
}

fn smoke_test(addr: &str, requests: usize) {
    eprintln!("smoke test: {} pipelined requests to {}", requests, addr);
    let mut stream = TcpStream::connect(addr).expect("failed to connect");

    let mut buf = Vec::new();
    for i in 0..requests {
        write_frame(&mut buf, &request_payload(i));
    }
    stream.write_all(&buf).expect("failed to write");

    let start = Instant::now();
    for i in 0..requests {
        let got = read_frame(&mut stream).expect("failed to read response");
        assert_eq!(got, request_payload(i), "response {} out of order", i);
    }
    eprintln!(
        "smoke test: PASSED ({} requests in {:?})",
        requests,
        start.elapsed()
    );
}

fn stall_test(addr: &str, limit_ms: u64) {
    eprintln!("stall test: connecting to {}", addr);
    let mut stream = TcpStream::connect(addr).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_millis(limit_ms)))
        .expect("failed to set read timeout");

    let mut buf = Vec::new();
    write_frame(&mut buf, b"stall");
    stream.write_all(&buf).expect("failed to write");

    let start = Instant::now();
    let mut scratch = [0u8; 64];
    match stream.read(&mut scratch) {
        Ok(0) => eprintln!("stall test: PASSED (closed after {:?})", start.elapsed()),
        Err(e) if e.kind() == ErrorKind::ConnectionReset => {
            eprintln!("stall test: PASSED (reset after {:?})", start.elapsed())
        }
        Ok(n) => panic!("stall test: unexpected {} bytes from proxy", n),
        Err(e) => panic!("stall test: no close within {} ms ({})", limit_ms, e),
    }
}

fn echo_backend(addr: &str, silent: bool) {
    let listener = TcpListener::bind(addr).expect("failed to bind");
    eprintln!(
        "echo backend on {} ({})",
        addr,
        if silent { "silent" } else { "echoing" }
    );
    for stream in listener.incoming() {
        let Ok(stream) = stream else { continue };
        thread::spawn(move || serve_echo(stream, silent));
    }
}

fn serve_echo(mut stream: TcpStream, silent: bool) {
    loop {
        let payload = match read_frame(&mut stream) {
            Ok(p) => p,
            Err(_) => return,
        };
        if silent {
            continue;
        }
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        write_frame(&mut out, &payload);
        if stream.write_all(&out).is_err() {
            return;
        }
    }
}
