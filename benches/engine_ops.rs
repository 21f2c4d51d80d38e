//! Engine operation benchmarks.
//!
//! Measures write throughput, point lookups, ANN search at varying
//! ef, seal cost, and compaction over overlapping segments.
//!
//! Run: cargo bench --bench engine_ops

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use svdb::{Engine, EngineOptions};

const DIM: usize = 64;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn options() -> EngineOptions {
    let mut opts = EngineOptions::new(DIM);
    opts.memtable_max_records = 100_000;
    opts.compaction_threshold = 64;
    opts
}

fn make_vectors(count: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (0..DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

fn filled_engine(count: usize) -> (Engine, Vec<Vec<f32>>) {
    let engine = Engine::ephemeral(options()).unwrap();
    let vectors = make_vectors(count, 42);
    for (i, v) in vectors.iter().enumerate() {
        engine
            .store(format!("id_{:06}", i).as_bytes(), v.clone())
            .unwrap();
    }
    (engine, vectors)
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_store(c: &mut Criterion) {
    let vectors = make_vectors(10_000, 1);
    c.bench_function("store_10k", |b| {
        b.iter_batched(
            || (Engine::ephemeral(options()).unwrap(), vectors.clone()),
            |(engine, vectors)| {
                for (i, v) in vectors.into_iter().enumerate() {
                    engine
                        .store(format!("id_{:06}", i).as_bytes(), v)
                        .unwrap();
                }
                black_box(engine)
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_get(c: &mut Criterion) {
    let (engine, _) = filled_engine(10_000);
    c.bench_function("get_hot", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let id = format!("id_{:06}", i % 10_000);
            i += 1;
            black_box(engine.get(id.as_bytes()).unwrap())
        })
    });
}

fn bench_search(c: &mut Criterion) {
    let (engine, vectors) = filled_engine(10_000);
    let mut group = c.benchmark_group("search_top10");
    for ef in [32usize, 64, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(ef), &ef, |b, &ef| {
            let mut i = 0usize;
            b.iter(|| {
                let q = &vectors[(i * 31) % vectors.len()];
                i += 1;
                black_box(engine.search(q, 10, Some(ef)).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_seal(c: &mut Criterion) {
    let vectors = make_vectors(5_000, 2);
    c.bench_function("seal_5k", |b| {
        b.iter_batched(
            || {
                let engine = Engine::ephemeral(options()).unwrap();
                for (i, v) in vectors.iter().enumerate() {
                    engine
                        .store(format!("id_{:06}", i).as_bytes(), v.clone())
                        .unwrap();
                }
                engine
            },
            |engine| {
                engine.flush().unwrap();
                black_box(engine)
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_compaction(c: &mut Criterion) {
    let vectors = make_vectors(4_000, 3);
    c.bench_function("compact_8_segments", |b| {
        b.iter_batched(
            || {
                let engine = Engine::ephemeral(options()).unwrap();
                // Eight segments with 50% id overlap.
                for chunk in 0..8usize {
                    for i in 0..500usize {
                        let id = format!("id_{:06}", chunk * 250 + i);
                        engine
                            .store(id.as_bytes(), vectors[(chunk * 500 + i) % vectors.len()].clone())
                            .unwrap();
                    }
                    engine.flush().unwrap();
                }
                engine
            },
            |engine| {
                engine.maybe_compact(Some(1)).unwrap();
                black_box(engine)
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(
    benches,
    bench_store,
    bench_get,
    bench_search,
    bench_seal,
    bench_compaction
);
criterion_main!(benches);
