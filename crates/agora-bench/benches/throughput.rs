//! Throughput benchmarks for the Agora hub.
//!
//! Room fan-out runs real room and connection actors over in-memory
//! transports, so the numbers include mailbox hops but no network I/O.

use agora_core::{derive_private_room_name, Hub, Identity, MemoryStore, PresenceRegistry};
use agora_transport::memory::{self, MemoryPeer};
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::Mutex;

const ROOM: &str = "bench";

/// Connect `members` memory clients to one public room and discard the
/// presence chatter their joins produce.
fn setup_room(rt: &Runtime, members: usize) -> (Arc<Hub>, Vec<MemoryPeer>) {
    rt.block_on(async {
        let hub = Arc::new(Hub::new(Arc::new(MemoryStore::new())));
        let mut peers = Vec::with_capacity(members);

        for i in 0..members {
            let (conn, peer) = memory::pair();
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                let identity = Identity::new(format!("user-{i}"), 0);
                let _ = hub.join_room(ROOM, Box::new(conn), identity).await;
            });
            peers.push(peer);
        }

        while hub.stats().connected_users < members {
            tokio::task::yield_now().await;
        }
        let room = hub.room(ROOM).unwrap();
        assert_eq!(room.snapshot().await.unwrap().len(), members);

        for peer in &mut peers {
            while let Ok(Some(_)) =
                tokio::time::timeout(Duration::from_millis(10), peer.recv()).await
            {}
        }

        (hub, peers)
    })
}

fn bench_room_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("room_fanout");
    group.sample_size(20);

    let frame = Bytes::from_static(br#"{"type":"message","name":"user-0","message":"hello"}"#);

    for members in [10usize, 100, 500] {
        let (_hub, peers) = setup_room(&rt, members);
        let peers = Arc::new(Mutex::new(peers));

        group.throughput(Throughput::Elements((members - 1) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, _| {
            b.to_async(&rt).iter_custom(|iters| {
                let peers = Arc::clone(&peers);
                let frame = frame.clone();
                async move {
                    let mut peers = peers.lock().await;
                    let (sender, receivers) = peers.split_first_mut().unwrap();
                    let start = Instant::now();
                    for _ in 0..iters {
                        sender.send(frame.clone()).unwrap();
                        for receiver in receivers.iter_mut() {
                            black_box(receiver.recv().await.unwrap());
                        }
                    }
                    start.elapsed()
                }
            });
        });
    }

    group.finish();
}

fn bench_presence(c: &mut Criterion) {
    let mut group = c.benchmark_group("presence");

    group.bench_function("open_close", |b| {
        let registry = PresenceRegistry::new();
        b.iter(|| {
            black_box(registry.connection_opened(black_box("alice")));
            black_box(registry.connection_closed(black_box("alice")));
        });
    });

    group.bench_function("open_close_second_tab", |b| {
        let registry = PresenceRegistry::new();
        registry.connection_opened("alice");
        b.iter(|| {
            black_box(registry.connection_opened(black_box("alice")));
            black_box(registry.connection_closed(black_box("alice")));
        });
    });

    group.bench_function("snapshot_1000", |b| {
        let registry = PresenceRegistry::new();
        registry.seed((0..1000).map(|i| format!("user-{i}")));
        b.iter(|| black_box(registry.snapshot()));
    });

    group.finish();
}

fn bench_hub(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("hub");

    group.bench_function("private_room_name", |b| {
        b.iter(|| derive_private_room_name(black_box("zoe"), black_box("adam")))
    });

    group.bench_function("get_or_create_existing", |b| {
        let _guard = rt.enter();
        let hub = Hub::new(Arc::new(MemoryStore::new()));
        hub.get_or_create_room("lobby");
        b.iter(|| black_box(hub.get_or_create_room(black_box("lobby"))));
    });

    group.bench_function("broadcast_100_rooms", |b| {
        let _guard = rt.enter();
        let hub = Hub::new(Arc::new(MemoryStore::new()));
        for i in 0..100 {
            hub.get_or_create_room(&format!("room-{i}"));
        }
        let payload = Bytes::from_static(br#"{"type":"user_joined","username":"alice"}"#);
        b.iter(|| black_box(hub.broadcast_to_all_rooms(black_box(&payload))));
    });

    group.finish();
}

criterion_group!(benches, bench_room_fanout, bench_presence, bench_hub);
criterion_main!(benches);
