//! Hot-path benchmarks: motor queue pair cycling and sync sample
//! ingestion. Both run once per event / probe at runtime, so their
//! cost bounds the scheduling overhead.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tact::config::SyncConfig;
use tact::event::MotorEvent;
use tactlink_core::queue::MotorQueue;
use tactlink_core::sync::SyncEngine;

fn queue_pair_cycle(c: &mut Criterion) {
    let queue = MotorQueue::new();
    c.bench_function("queue_enqueue_peek_dequeue_pair", |b| {
        b.iter(|| {
            queue
                .enqueue(0, MotorEvent::activate(10_000, 0, 80, 250), 100)
                .unwrap();
            black_box(queue.peek_next());
            queue.dequeue_next();
            queue.dequeue_next();
        })
    });
}

fn queue_peek_under_load(c: &mut Criterion) {
    let queue = MotorQueue::new();
    for i in 0..16 {
        queue
            .enqueue(0, MotorEvent::activate(10_000 + i, (i % 4) as u8, 80, 250), 100)
            .unwrap();
    }
    c.bench_function("queue_peek_full", |b| {
        b.iter(|| black_box(queue.peek_next()))
    });
}

fn sync_sample_ingest(c: &mut Criterion) {
    c.bench_function("sync_sample_ingest", |b| {
        let mut engine = SyncEngine::new(SyncConfig::default());
        let mut seq = 0u32;
        let mut now_ms = 0u64;
        b.iter(|| {
            seq = seq.wrapping_add(1);
            now_ms += 1_000;
            let t1 = now_ms * 1_000;
            engine.begin_ping(seq, t1);
            black_box(engine.on_pong(seq, t1 + 8_000, t1 + 8_100, t1 + 12_000, now_ms));
        })
    });
}

criterion_group!(benches, queue_pair_cycle, queue_peek_under_load, sync_sample_ingest);
criterion_main!(benches);
