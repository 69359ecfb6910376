//! Aggregation fold and migration throughput benchmark

use rollup_migrator::aggregation::{summarize, AggregationMerger};
use rollup_migrator::clock::ManualClock;
use rollup_migrator::config::MigrationConfig;
use rollup_migrator::migration::{AggregateMigrator, KeySource};
use rollup_migrator::schema::{AggregateRecord, Bucket, RawSample, SampleKind};
use rollup_migrator::store::{LocalStorageSession, StorageSession};

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

const HOUR: i64 = 3_600_000;
const NOW: i64 = 20_000 * 24 * HOUR;

fn create_samples(timestamps: usize) -> Vec<RawSample> {
    let start = NOW - timestamps as i64 * HOUR;
    (0..timestamps as i64)
        .flat_map(|i| {
            let ts = start + i * HOUR;
            let base = (i % 100) as f64;
            [
                RawSample::new(1, ts, SampleKind::Max, base + 10.0, Some(1_209_600)),
                RawSample::new(1, ts, SampleKind::Min, base, Some(1_209_600)),
                RawSample::new(1, ts, SampleKind::Avg, base + 5.0, Some(1_209_600)),
            ]
        })
        .collect()
}

fn benchmark_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for timestamps in [100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(timestamps as u64 * 3));

        let samples = create_samples(timestamps);
        let merger = AggregationMerger::new(Bucket::OneHour, NOW);

        group.bench_function(format!("{}_timestamps", timestamps), |b| {
            b.iter(|| {
                let outcome = merger.merge(black_box(samples.iter().copied()));
                black_box(outcome.records.len());
            });
        });
    }

    group.finish();
}

fn benchmark_summarize(c: &mut Criterion) {
    let mut group = c.benchmark_group("summarize");

    for rows in [1_000, 100_000] {
        group.throughput(Throughput::Elements(rows as u64));

        let records: Vec<AggregateRecord> = (0..rows as i64)
            .map(|i| {
                let v = (i % 50) as f64;
                AggregateRecord::new(1, Bucket::SixHour, i * 6 * HOUR, v, v - 1.0, v + 1.0)
            })
            .collect();

        group.bench_function(format!("{}_rows", rows), |b| {
            b.iter(|| black_box(summarize(0, black_box(&records))));
        });
    }

    group.finish();
}

fn benchmark_bucket_migration(c: &mut Criterion) {
    let mut group = c.benchmark_group("bucket_migration");
    group.sample_size(10);
    let rt = tokio::runtime::Runtime::new().unwrap();

    for schedules in [100, 1_000] {
        let session = Arc::new(LocalStorageSession::new());
        for id in 0..schedules {
            for sample in create_samples(24) {
                session.insert_legacy(Bucket::OneHour, RawSample { schedule_id: id, ..sample });
            }
        }
        group.throughput(Throughput::Elements(schedules as u64));

        group.bench_function(format!("{}_schedules", schedules), |b| {
            b.to_async(&rt).iter(|| {
                let session: Arc<dyn StorageSession> = session.clone();
                async move {
                    let dir = tempfile::TempDir::new().unwrap();
                    let config = MigrationConfig {
                        data_dir: dir.path().to_path_buf(),
                        read_limit: 1_000_000.0,
                        write_limit: 1_000_000.0,
                        warmup: Duration::ZERO,
                        drop_legacy_tables: false,
                        buckets: vec![Bucket::OneHour],
                        ..Default::default()
                    };
                    let report = AggregateMigrator::new(session, KeySource::IndexScan, config)
                        .unwrap()
                        .with_clock(Arc::new(ManualClock::new(NOW)))
                        .run()
                        .await
                        .unwrap();
                    black_box(report);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_merge,
    benchmark_summarize,
    benchmark_bucket_migration,
);

criterion_main!(benches);
