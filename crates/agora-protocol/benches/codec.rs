//! Codec benchmarks for agora-protocol.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use agora_protocol::{codec, ChatEvent, ChatPayload};

fn message_frame(body_len: usize) -> Bytes {
    let body = "x".repeat(body_len);
    Bytes::from(format!(
        r#"{{"type":"message","name":"alice","message":"{body}","sender_id":1}}"#
    ))
}

fn bench_decode_message(c: &mut Criterion) {
    let raw = message_frame(64);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(raw.len() as u64));
    group.bench_function("message_64B", |b| {
        b.iter(|| codec::decode_event(black_box(&raw)))
    });
    group.bench_function("malformed", |b| {
        let raw = Bytes::from_static(b"definitely not json");
        b.iter(|| codec::decode_event(black_box(&raw)))
    });
    group.finish();
}

fn bench_stamp_inbound(c: &mut Criterion) {
    let raw = message_frame(256);

    let mut group = c.benchmark_group("stamp");
    group.throughput(Throughput::Bytes(raw.len() as u64));
    group.bench_function("message_256B", |b| {
        b.iter(|| codec::stamp_inbound(black_box(&raw), black_box(42)))
    });
    group.finish();
}

fn bench_encode_message(c: &mut Criterion) {
    let event = ChatEvent::Message(
        ChatPayload::new("alice", "x".repeat(64))
            .with_sender_id(1)
            .with_created_at("2024-05-01T10:00:00.123Z"),
    );

    c.bench_function("encode_message_64B", |b| {
        b.iter(|| codec::encode_event(black_box(&event)))
    });
}

criterion_group!(
    benches,
    bench_decode_message,
    bench_stamp_inbound,
    bench_encode_message
);
criterion_main!(benches);
