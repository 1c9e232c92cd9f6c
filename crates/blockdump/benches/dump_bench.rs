//! Benchmarks for block dumps.
//!
//! Run with: cargo bench --package alopex-blockdump
//!
//! ## Benchmark Categories
//!
//! - **Chunk Compression**: XOR chunk encode/decode
//! - **Block Linking**: hard-link extraction of sealed blocks
//! - **Head Flush**: writing the head as a new block
//! - **WAL Replay**: rebuilding the head on open

use alopex_blockdump::dump::{discover, link_block};
use alopex_blockdump::tsdb::gorilla::XorChunk;
use alopex_blockdump::tsdb::head::DEFAULT_CHUNK_RANGE;
use alopex_blockdump::tsdb::{Db, DbOptions, Head, Labels, LeveledCompactor, Sample};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::path::Path;
use tempfile::TempDir;

const HOUR: i64 = 60 * 60 * 1000;

/// Generate a scrape-like series: 15s interval, slowly varying values.
fn generate_samples(count: usize) -> Vec<Sample> {
    let mut value = 50.0;
    (0..count)
        .map(|i| {
            value += (i as f64 * 0.1).sin() * 0.1;
            Sample::new(i as i64 * 15_000, value)
        })
        .collect()
}

fn filled_head(series: usize, samples_per_series: usize) -> Head {
    let head = Head::new(DEFAULT_CHUNK_RANGE);
    let mut app = head.appender();
    for s in 0..series {
        let labels = Labels::from_pairs([("__name__", "bench"), ("id", s.to_string().as_str())]);
        for sample in generate_samples(samples_per_series) {
            app.add(&labels, sample.t, sample.v).unwrap();
        }
    }
    app.commit().unwrap();
    head
}

fn write_blocks(db: &Path, count: i64) {
    let compactor = LeveledCompactor::new(vec![2 * HOUR]).unwrap();
    let head = filled_head(50, 480);
    for i in 0..count {
        compactor
            .write(db, &head, i * 1000, i * 1000 + 999, None)
            .unwrap();
    }
}

fn bench_chunk_encode(c: &mut Criterion) {
    let samples = generate_samples(120);

    c.bench_function("xor_chunk_encode_120", |b| {
        b.iter(|| XorChunk::encode(black_box(&samples)))
    });

    let chunk = XorChunk::encode(&samples);
    c.bench_function("xor_chunk_decode_120", |b| b.iter(|| chunk.decode().unwrap()));
}

fn bench_link_blocks(c: &mut Criterion) {
    let mut group = c.benchmark_group("link_blocks");

    for count in [1i64, 10, 50] {
        let db = TempDir::new().unwrap();
        write_blocks(db.path(), count);
        let blocks = discover(db.path()).unwrap();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &blocks, |b, blocks| {
            b.iter_with_setup(
                || TempDir::new().unwrap(),
                |out| {
                    for block in blocks {
                        link_block(block, out.path()).unwrap();
                    }
                },
            )
        });
    }
    group.finish();
}

fn bench_head_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("head_flush");
    group.sample_size(20);
    let compactor = LeveledCompactor::new(vec![2 * HOUR]).unwrap();

    for series in [10usize, 100] {
        let head = filled_head(series, 480);
        group.throughput(Throughput::Elements((series * 480) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(series), &head, |b, head| {
            b.iter_with_setup(
                || TempDir::new().unwrap(),
                |out| {
                    compactor
                        .write(out.path(), head, 0, 2 * HOUR, None)
                        .unwrap()
                },
            )
        });
    }
    group.finish();
}

fn bench_wal_replay(c: &mut Criterion) {
    let db_dir = TempDir::new().unwrap();
    {
        let db = Db::open(db_dir.path(), DbOptions::default()).unwrap();
        let mut app = db.appender();
        for s in 0..100 {
            let labels = Labels::from_pairs([("id", s.to_string())]);
            for sample in generate_samples(240) {
                app.add(&labels, sample.t, sample.v).unwrap();
            }
        }
        app.commit().unwrap();
        db.close().unwrap();
    }
    let wal_dir = db_dir.path().join("wal");

    let mut group = c.benchmark_group("wal_replay");
    group.sample_size(20);
    group.throughput(Throughput::Elements(100 * 240));
    group.bench_function("100x240", |b| {
        b.iter(|| {
            let head = Head::open(&wal_dir, DEFAULT_CHUNK_RANGE);
            head.init(i64::MIN).unwrap();
            black_box(head.num_samples())
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_chunk_encode,
    bench_link_blocks,
    bench_head_flush,
    bench_wal_replay
);
criterion_main!(benches);
