//! End-to-end throughput benchmark for Agora.
//!
//! Connects N WebSocket clients to one public room of a running server and
//! has every client post messages as fast as it can. Each message fans out to
//! the other N-1 clients, so the receive rate is what gets reported.
//!
//! ```bash
//! agora &
//! e2e_throughput 32 ws://127.0.0.1:8081
//! ```

use agora_transport::{websocket, Connection};
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;

const DEFAULT_SERVER: &str = "ws://127.0.0.1:8081";
const ROOM: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let server = args.get(2).cloned().unwrap_or_else(|| DEFAULT_SERVER.to_string());

    println!("Agora end-to-end throughput");
    println!("  server:  {server}");
    println!("  room:    {ROOM}");
    println!("  clients: {num_clients}");
    println!();

    let received = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let handles: Vec<_> = (0..num_clients)
        .map(|client_id| {
            let received = Arc::clone(&received);
            let barrier = Arc::clone(&barrier);
            let url = format!("{server}/room?room={ROOM}&username=bench-{client_id}");
            tokio::spawn(async move {
                if let Err(e) = run_client(&url, client_id, received, barrier).await {
                    eprintln!("client {client_id} failed: {e}");
                }
            })
        })
        .collect();

    barrier.wait().await;
    println!("all {num_clients} clients joined, warming up for {WARMUP_SECS}s");
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    received.store(0, Ordering::SeqCst);
    let start = Instant::now();
    println!("measuring for {BENCH_SECS}s");
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed().as_secs_f64();
    let total = received.load(Ordering::SeqCst);
    let rate = total as f64 / elapsed;

    println!();
    println!("  duration:        {elapsed:>10.2}s");
    println!("  frames received: {total:>10}");
    println!("  throughput:      {rate:>10.0} msg/s");
    println!(
        "  per client:      {:>10.0} msg/s",
        rate / num_clients.max(1) as f64
    );

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    url: &str,
    client_id: usize,
    received: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let conn = Box::new(websocket::connect(url).await?);
    let (mut reader, mut writer) = conn.split();

    barrier.wait().await;

    let recv_task = tokio::spawn(async move {
        while let Ok(Some(frame)) = reader.recv().await {
            let is_chat = serde_json::from_slice::<Value>(&frame)
                .map(|v| v["type"] == "message")
                .unwrap_or(false);
            if is_chat {
                received.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    let frame = Bytes::from(format!(
        r#"{{"type":"message","name":"bench-{client_id}","message":"{}"}}"#,
        "x".repeat(64)
    ));
    while writer.send(frame.clone()).await.is_ok() {
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
