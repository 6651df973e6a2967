use criterion::{black_box, criterion_group, criterion_main, Criterion};
use factd_core::{FactStore, PageStorage, Schema, TxOp, Value};
use factd_sidecar::protocol::{encode_frame, FrameDecoder, Message, Op};
use factd_sidecar::storage::{CacheConfig, CachedStorage, MemoryBackingStore};
use std::sync::Arc;

fn transact_op() -> Op {
    Op::Transact {
        name: "bench".into(),
        tx_data: (0..16)
            .map(|i| {
                TxOp::entity([
                    ("block/uuid", Value::str(format!("u{i}"))),
                    ("block/content", Value::str("lorem ipsum dolor sit amet")),
                ])
            })
            .collect(),
        tx_meta: None,
    }
}

fn bench_request_encode(c: &mut Criterion) {
    let op = transact_op();
    c.bench_function("request_encode_16_entities", |b| {
        b.iter(|| {
            let msg = Message::Request(black_box(&op).to_request("id").unwrap());
            black_box(msg.to_frame().unwrap());
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let frame = Message::Request(transact_op().to_request("id").unwrap())
        .to_frame()
        .unwrap();
    let stream: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * 64).collect();

    c.bench_function("frame_decode_64_frames", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::default();
            // Feed in socket-sized pieces
            for piece in stream.chunks(4096) {
                decoder.extend(piece);
                while let Some(body) = decoder.next_frame().unwrap() {
                    black_box(Message::decode(&body).unwrap());
                }
            }
        })
    });
}

fn bench_encode_frame_1kb(c: &mut Criterion) {
    let body = vec![7u8; 1024];
    c.bench_function("encode_frame_1KB", |b| {
        b.iter(|| black_box(encode_frame(black_box(&body))))
    });
}

fn bench_cache_hit(c: &mut Criterion) {
    let storage = CachedStorage::new(Arc::new(MemoryBackingStore::new()), CacheConfig::default());
    for addr in 1..=256u64 {
        storage.store(addr, vec![0u8; 4096]).unwrap();
    }

    c.bench_function("cache_restore_hit", |b| {
        let mut addr = 0u64;
        b.iter(|| {
            addr = addr % 256 + 1;
            black_box(storage.restore(addr).unwrap());
        })
    });
}

fn bench_cache_miss(c: &mut Criterion) {
    let storage = CachedStorage::new(
        Arc::new(MemoryBackingStore::new()),
        CacheConfig {
            max_bytes: 64 * 1024,
            max_pages: 8,
        },
    );
    for addr in 1..=256u64 {
        storage.store(addr, vec![0u8; 4096]).unwrap();
    }

    c.bench_function("cache_restore_miss", |b| {
        let mut addr = 0u64;
        b.iter(|| {
            // Stride past the resident set so every restore misses
            addr = (addr + 17) % 256 + 1;
            black_box(storage.restore(addr).unwrap());
        })
    });
}

fn bench_transact_through_cache(c: &mut Criterion) {
    let storage = Arc::new(CachedStorage::new(
        Arc::new(MemoryBackingStore::new()),
        CacheConfig::for_testing(),
    ));
    let store = FactStore::open(storage, Schema::new()).unwrap();
    let mut i = 0u64;

    c.bench_function("transact_tiny_cache", |b| {
        b.iter(|| {
            i += 1;
            let tx = vec![TxOp::entity([("block/content", Value::str(format!("b{i}")))])];
            black_box(store.transact(tx, None).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_request_encode,
    bench_frame_decode,
    bench_encode_frame_1kb,
    bench_cache_hit,
    bench_cache_miss,
    bench_transact_through_cache,
);
criterion_main!(benches);
