//! Criterion benchmarks for the caller-facing write path: `EventStore::append`
//! on its own and the full `Pipeline::record_event` (audit line + record).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use event_relay::recording::{Event, EventStore};
use event_relay::{Pipeline, PipelineConfig};
use tempfile::tempdir;

fn bench_store_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_append");

    for message_len in [32usize, 512] {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path()).unwrap();
        let event = Event::now("polygon", "x".repeat(message_len));

        group.bench_with_input(BenchmarkId::from_parameter(message_len), &event, |b, event| {
            b.iter(|| black_box(store.append(black_box(event))))
        });
    }

    group.finish();
}

fn bench_record_event(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    // No runtime: nothing runs in the background
    let config = PipelineConfig {
        max_pending: usize::MAX,
        recent_events_capacity: 100,
        ..PipelineConfig::local(dir.path())
    };
    let pipeline = Pipeline::new(config).unwrap();

    c.bench_function("pipeline_record_event", |b| {
        b.iter(|| pipeline.record_event(black_box("polygon"), black_box("429 Too Many Requests")))
    });
}

criterion_group!(benches, bench_store_append, bench_record_event);
criterion_main!(benches);
