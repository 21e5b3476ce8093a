//! TCP load-test client for the proxy.
//!
//! Opens a set of concurrent workers; each one repeatedly connects through
//! the proxy, writes a payload, reads until the stream closes, and counts the
//! round trip. Results are printed at the end of the run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Parser)]
#[command(author, version, about = "TCP load tester", long_about = None)]
struct Cli {
    /// Proxy address to test against.
    #[arg(long, default_value = "127.0.0.1:9000")]
    addr: String,

    /// Number of concurrent workers.
    #[arg(short, long, default_value_t = 10)]
    concurrency: usize,

    /// Duration of the test in seconds.
    #[arg(short, long, default_value_t = 10)]
    duration: u64,

    /// Payload size per request in bytes.
    #[arg(short, long, default_value_t = 128)]
    payload: usize,
}

async fn worker(
    addr: String,
    payload: Arc<Vec<u8>>,
    deadline: Instant,
    requests: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
) {
    while Instant::now() < deadline {
        match run_once(&addr, &payload).await {
            Ok(()) => requests.fetch_add(1, Ordering::Relaxed),
            Err(_) => errors.fetch_add(1, Ordering::Relaxed),
        };
    }
}

async fn run_once(addr: &str, payload: &[u8]) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(payload).await?;
    stream.shutdown().await?;

    let mut sink = Vec::with_capacity(payload.len());
    stream.read_to_end(&mut sink).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    println!(
        "Starting load test: {} with {} workers for {}s",
        args.addr, args.concurrency, args.duration
    );

    let payload = Arc::new(vec![0x2au8; args.payload.max(1)]);
    let requests = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));

    let start = Instant::now();
    let deadline = start + Duration::from_secs(args.duration);

    let mut workers = Vec::with_capacity(args.concurrency);
    for _ in 0..args.concurrency {
        workers.push(tokio::spawn(worker(
            args.addr.clone(),
            Arc::clone(&payload),
            deadline,
            Arc::clone(&requests),
            Arc::clone(&errors),
        )));
    }
    for w in workers {
        let _ = w.await;
    }

    let elapsed = start.elapsed();
    let requests = requests.load(Ordering::Relaxed);
    let errors = errors.load(Ordering::Relaxed);

    println!("\n--- Results ---");
    println!("Duration: {:.2?}", elapsed);
    println!("Total Requests: {requests}");
    println!("Errors: {errors}");
    println!("Requests/sec: {:.2}", requests as f64 / elapsed.as_secs_f64());
}
