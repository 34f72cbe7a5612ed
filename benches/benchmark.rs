//! Broadcaster Performance Benchmark Suite
//!
//! Measures how long one frame takes to fan out to every admitted client:
//! - Small and full-size JPEG payloads
//! - 1, 3 and 10 clients (the default ceilings)
//!
//! Clients sit on in-memory duplex pipes whose far ends are drained by
//! background tasks, so the numbers cover framing and write scheduling only.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mjpeg_rs::server::{Client, ClientManager, Frame};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, DuplexStream},
    runtime::Runtime,
};

const PIPE_CAPACITY: usize = 1 << 20;

/// Admits `count` streaming clients and spawns a reader draining each pipe.
async fn populate(count: usize) -> ClientManager<DuplexStream> {
    let manager = ClientManager::new();
    let addr: SocketAddr = "127.0.0.1:4444".parse().unwrap();

    for _ in 0..count {
        let (server_end, mut viewer_end) = tokio::io::duplex(PIPE_CAPACITY);
        let (_, writer) = tokio::io::split(server_end);
        let client = Arc::new(Client::new(addr, writer, true, Duration::from_secs(5)));
        client.start_stream(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        manager.try_admit(client, count).unwrap();

        tokio::spawn(async move {
            let mut sink = vec![0u8; 64 * 1024];
            while let Ok(n) = viewer_end.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        });
    }
    manager
}

/// Benchmark group for frame fan-out
///
/// Measures:
/// - Per-frame broadcast latency by client count
/// - Byte throughput for a 640x480-sized JPEG
fn bench_broadcast(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("broadcast");
    group.measurement_time(Duration::from_secs(5));
    group.warm_up_time(Duration::from_secs(1));

    for &(label, size) in &[("4KiB", 4 * 1024), ("48KiB", 48 * 1024)] {
        let frame = Frame::new(vec![0xAB; size], 640, 480);
        for &clients in &[1usize, 3, 10] {
            let manager = rt.block_on(populate(clients));
            group.throughput(Throughput::Bytes((size * clients) as u64));
            group.bench_with_input(
                BenchmarkId::new(label, clients),
                &clients,
                |b, &expected| {
                    b.to_async(&rt).iter(|| async {
                        let report = manager.broadcast(&frame).await;
                        assert_eq!(report.queued, expected);
                        manager.wait_idle().await;
                    });
                },
            );
            rt.block_on(manager.close_all());
        }
    }

    group.finish();
}

// Configure benchmark groups
criterion_group!(
    name = benches;
    config = Criterion::default()
        .significance_level(0.05)
        .noise_threshold(0.05);
    targets = bench_broadcast
);
criterion_main!(benches);
