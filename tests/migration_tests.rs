//! End-to-end migration runs against the local store session

use rollup_migrator::clock::ManualClock;
use rollup_migrator::cluster::NodeRegistry;
use rollup_migrator::config::MigrationConfig;
use rollup_migrator::migration::{AggregateMigrator, KeySource, MigrationLog, MigrationReport};
use rollup_migrator::schema::{AggregateRecord, Bucket, RawSample, SampleKind, ScheduleId};
use rollup_migrator::store::{LocalStorageSession, StaticScheduleCatalog, StorageSession};
use rollup_migrator::{Error, Result};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;
/// Fixed "now" for every run
const NOW: i64 = 20_000 * DAY;

fn config(dir: &Path, buckets: &[Bucket]) -> MigrationConfig {
    MigrationConfig {
        data_dir: dir.to_path_buf(),
        read_limit: 100_000.0,
        write_limit: 100_000.0,
        warmup: Duration::ZERO,
        batch_size: 4,
        write_group_size: 3,
        retry_backoff: Duration::from_millis(1),
        drop_legacy_tables: false,
        buckets: buckets.to_vec(),
        ..Default::default()
    }
}

/// Legacy max/min/avg rows for one timestamp
fn seed_triple(
    session: &LocalStorageSession,
    bucket: Bucket,
    id: ScheduleId,
    timestamp: i64,
    (avg, min, max): (f64, f64, f64),
    ttl: Option<i32>,
) {
    for (kind, value) in [
        (SampleKind::Max, max),
        (SampleKind::Min, min),
        (SampleKind::Avg, avg),
    ] {
        session.insert_legacy(bucket, RawSample::new(id, timestamp, kind, value, ttl));
    }
}

async fn run(
    session: &Arc<LocalStorageSession>,
    key_source: KeySource,
    config: MigrationConfig,
) -> Result<MigrationReport> {
    let session: Arc<dyn StorageSession> = session.clone();
    AggregateMigrator::new(session, key_source, config)?
        .with_clock(Arc::new(ManualClock::new(NOW)))
        .run()
        .await
}

async fn logged(dir: &Path, bucket: Bucket) -> HashSet<ScheduleId> {
    let log = MigrationLog::open(dir, bucket).await.unwrap();
    let ids = log.read().await.unwrap();
    log.close().await.unwrap();
    ids
}

#[tokio::test]
async fn incomplete_groups_are_dropped_but_schedule_is_logged() {
    let dir = TempDir::new().unwrap();
    let session = Arc::new(LocalStorageSession::new());
    let (t1, t2) = (NOW - 2 * HOUR, NOW - HOUR);
    seed_triple(&session, Bucket::OneHour, 42, t1, (3.0, 1.0, 8.0), None);
    session.insert_legacy(
        Bucket::OneHour,
        RawSample::new(42, t2, SampleKind::Max, 10.0, None),
    );
    session.insert_legacy(
        Bucket::OneHour,
        RawSample::new(42, t2, SampleKind::Avg, 4.0, None),
    );

    let report = run(&session, KeySource::IndexScan, config(dir.path(), &[Bucket::OneHour]))
        .await
        .unwrap();

    assert_eq!(
        session.aggregates(Bucket::OneHour),
        vec![AggregateRecord::new(42, Bucket::OneHour, t1, 3.0, 1.0, 8.0)]
    );
    let bucket = report.bucket(Bucket::OneHour).unwrap();
    assert_eq!(bucket.skipped_incomplete, 1);
    assert_eq!(bucket.migrated, 1);
    assert_eq!(bucket.remaining, 0);
    assert_eq!(logged(dir.path(), Bucket::OneHour).await, HashSet::from([42]));
}

#[tokio::test]
async fn every_candidate_is_migrated_across_batches() {
    let dir = TempDir::new().unwrap();
    let session = Arc::new(LocalStorageSession::new());
    let ids: Vec<ScheduleId> = (1..=11).collect();
    for &id in &ids {
        for slice in 0..5 {
            let ts = Bucket::SixHour.slice_start(NOW - 2 * DAY) + slice * 6 * HOUR;
            seed_triple(&session, Bucket::SixHour, id, ts, (2.0, 1.0, 3.0), None);
        }
    }
    let catalog = Arc::new(StaticScheduleCatalog::new(ids.clone()));

    let report = run(
        &session,
        KeySource::Catalog(catalog),
        config(dir.path(), &[Bucket::SixHour]),
    )
    .await
    .unwrap();

    let bucket = report.bucket(Bucket::SixHour).unwrap();
    assert_eq!(bucket.candidates, 11);
    assert_eq!(bucket.migrated, 11);
    assert_eq!(bucket.records_written, 55);
    assert_eq!(session.aggregates(Bucket::SixHour).len(), 55);
    assert_eq!(
        logged(dir.path(), Bucket::SixHour).await,
        ids.into_iter().collect::<HashSet<_>>()
    );
}

#[tokio::test]
async fn rerun_skips_logged_schedules() {
    let dir = TempDir::new().unwrap();
    let session = Arc::new(LocalStorageSession::new());
    for id in 1..=6 {
        seed_triple(&session, Bucket::OneHour, id, NOW - HOUR, (1.0, 1.0, 1.0), None);
    }

    // Schedules 1 and 2 were finished by an earlier, interrupted run
    let log = MigrationLog::open(dir.path(), Bucket::OneHour).await.unwrap();
    log.write(1).await.unwrap();
    log.write(2).await.unwrap();
    log.close().await.unwrap();

    let first = run(&session, KeySource::IndexScan, config(dir.path(), &[Bucket::OneHour]))
        .await
        .unwrap();
    let bucket = first.bucket(Bucket::OneHour).unwrap();
    assert_eq!(bucket.already_migrated, 2);
    assert_eq!(bucket.migrated, 4);
    assert_eq!(session.legacy_reads(Bucket::OneHour, 1), 0);
    assert_eq!(session.legacy_reads(Bucket::OneHour, 3), 1);

    let second = run(&session, KeySource::IndexScan, config(dir.path(), &[Bucket::OneHour]))
        .await
        .unwrap();
    let bucket = second.bucket(Bucket::OneHour).unwrap();
    assert_eq!(bucket.already_migrated, 6);
    assert_eq!(bucket.migrated, 0);
    for id in 3..=6 {
        assert_eq!(session.legacy_reads(Bucket::OneHour, id), 1);
    }
}

#[tokio::test]
async fn ttl_is_reduced_by_elapsed_time() {
    let dir = TempDir::new().unwrap();
    let session = Arc::new(LocalStorageSession::new());
    let ts = NOW - 100_000;
    seed_triple(&session, Bucket::OneHour, 5, ts, (2.0, 1.0, 3.0), Some(1_000));
    seed_triple(&session, Bucket::OneHour, 6, ts, (2.0, 1.0, 3.0), Some(50));
    seed_triple(&session, Bucket::OneHour, 7, NOW - 15 * DAY, (2.0, 1.0, 3.0), None);

    let report = run(&session, KeySource::IndexScan, config(dir.path(), &[Bucket::OneHour]))
        .await
        .unwrap();

    let records = session.aggregates(Bucket::OneHour);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].schedule_id, 5);
    assert_eq!(records[0].ttl, Some(900));

    let bucket = report.bucket(Bucket::OneHour).unwrap();
    assert_eq!(bucket.skipped_expired, 2);
    assert_eq!(bucket.migrated, 3);
}

#[tokio::test]
async fn failed_reads_and_writes_are_retried_within_the_run() {
    let dir = TempDir::new().unwrap();
    let session = Arc::new(LocalStorageSession::new());
    for id in 1..=8 {
        seed_triple(&session, Bucket::OneHour, id, NOW - HOUR, (2.0, 1.0, 3.0), None);
    }
    session.fail_reads(3, 2);
    session.fail_reads(8, 1);
    session.fail_write_batches(2);

    let report = run(&session, KeySource::IndexScan, config(dir.path(), &[Bucket::OneHour]))
        .await
        .unwrap();

    let bucket = report.bucket(Bucket::OneHour).unwrap();
    assert_eq!(bucket.read_failures, 3);
    assert_eq!(bucket.write_failures, 2);
    assert_eq!(bucket.migrated, 8);
    assert_eq!(bucket.remaining, 0);
    assert_eq!(session.aggregates(Bucket::OneHour).len(), 8);
    assert_eq!(logged(dir.path(), Bucket::OneHour).await.len(), 8);
}

#[tokio::test]
async fn run_with_outstanding_work_fails_and_next_run_finishes_it() {
    let dir = TempDir::new().unwrap();
    let session = Arc::new(LocalStorageSession::new());
    for id in 1..=5 {
        seed_triple(&session, Bucket::OneHour, id, NOW - HOUR, (2.0, 1.0, 3.0), None);
    }
    session.fail_reads(4, u32::MAX);

    let bounded = MigrationConfig {
        max_run_duration: Some(Duration::from_millis(200)),
        ..config(dir.path(), &[Bucket::OneHour])
    };
    let err = run(&session, KeySource::IndexScan, bounded).await.unwrap_err();
    match err {
        Error::Incomplete { outstanding } => {
            assert_eq!(outstanding, vec![(Bucket::OneHour, 1)]);
        }
        other => panic!("expected an incomplete run, got {other:?}"),
    }
    let done = logged(dir.path(), Bucket::OneHour).await;
    assert_eq!(done, HashSet::from([1, 2, 3, 5]));

    session.fail_reads(4, 0);
    let report = run(&session, KeySource::IndexScan, config(dir.path(), &[Bucket::OneHour]))
        .await
        .unwrap();
    let bucket = report.bucket(Bucket::OneHour).unwrap();
    assert_eq!(bucket.already_migrated, 4);
    assert_eq!(bucket.migrated, 1);
    assert_eq!(session.legacy_reads(Bucket::OneHour, 1), 1);
}

#[tokio::test]
async fn scan_failure_aborts_the_run() {
    let dir = TempDir::new().unwrap();
    let session = Arc::new(LocalStorageSession::new());
    seed_triple(&session, Bucket::SixHour, 1, NOW - DAY, (2.0, 1.0, 3.0), None);
    session.fail_index_scan(true);

    let concurrent = MigrationConfig {
        concurrent_buckets: true,
        drop_legacy_tables: true,
        ..config(dir.path(), &Bucket::ALL)
    };
    let err = run(&session, KeySource::IndexScan, concurrent)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Scan { .. }), "unexpected error: {err:?}");
    assert!(session.all_aggregates().is_empty());
    assert!(session.has_table(Bucket::SixHour.legacy_table()));
}

#[tokio::test]
async fn concurrent_buckets_complete_and_drop_legacy_tables() {
    let dir = TempDir::new().unwrap();
    let session = Arc::new(LocalStorageSession::new());
    for bucket in Bucket::ALL {
        for id in 1..=3 {
            let ts = bucket.slice_start(NOW - DAY);
            seed_triple(&session, bucket, id, ts, (5.0, 4.0, 6.0), None);
        }
    }

    let concurrent = MigrationConfig {
        concurrent_buckets: true,
        drop_legacy_tables: true,
        ..config(dir.path(), &Bucket::ALL)
    };
    let report = run(&session, KeySource::IndexScan, concurrent).await.unwrap();

    for bucket in Bucket::ALL {
        assert_eq!(session.aggregates(bucket).len(), 3, "bucket {bucket}");
        assert_eq!(report.bucket(bucket).unwrap().migrated, 3);
        assert_eq!(logged(dir.path(), bucket).await.len(), 3);
        assert!(!session.has_table(bucket.legacy_table()));
    }
    let mut dropped = report.dropped_tables.clone();
    dropped.sort();
    assert_eq!(
        dropped,
        vec![
            "one_hour_metrics".to_string(),
            "six_hour_metrics".to_string(),
            "twenty_four_hour_metrics".to_string(),
        ]
    );
}

#[tokio::test]
async fn schedule_spanning_several_pages_is_fully_migrated() {
    let dir = TempDir::new().unwrap();
    let session = Arc::new(LocalStorageSession::new());
    let timestamps: Vec<i64> = (1..=3).map(|h| NOW - h * HOUR).collect();
    for &ts in &timestamps {
        seed_triple(&session, Bucket::OneHour, 7, ts, (2.0, 1.0, 3.0), None);
    }
    seed_triple(&session, Bucket::OneHour, 8, NOW - HOUR, (5.0, 4.0, 6.0), None);

    let report = run(
        &session,
        KeySource::IndexScan,
        MigrationConfig {
            read_page_size: 2,
            ..config(dir.path(), &[Bucket::OneHour])
        },
    )
    .await
    .unwrap();

    let written: Vec<i64> = session
        .aggregates(Bucket::OneHour)
        .iter()
        .filter(|r| r.schedule_id == 7)
        .map(|r| r.timestamp)
        .collect();
    let mut expected = timestamps.clone();
    expected.sort();
    assert_eq!(written, expected);
    assert_eq!(report.bucket(Bucket::OneHour).unwrap().records_written, 4);
    assert_eq!(session.legacy_reads(Bucket::OneHour, 7), 1);
    assert_eq!(logged(dir.path(), Bucket::OneHour).await, HashSet::from([7, 8]));
}

#[tokio::test]
async fn node_timeouts_lower_rates_during_a_run() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(NodeRegistry::with_nodes(0, ["10.0.0.1", "10.0.0.2", "10.0.0.3"]));
    let session = Arc::new(
        LocalStorageSession::new()
            .with_latency(Duration::from_millis(50))
            .with_node_registry(registry.clone()),
    );
    seed_triple(&session, Bucket::OneHour, 1, NOW - HOUR, (2.0, 1.0, 3.0), None);
    std::thread::sleep(Duration::from_millis(5));

    let storage: Arc<dyn StorageSession> = session.clone();
    let migrator = AggregateMigrator::new(
        storage,
        KeySource::Catalog(Arc::new(StaticScheduleCatalog::new(vec![1]))),
        config(dir.path(), &[Bucket::OneHour]),
    )
    .unwrap()
    .with_clock(Arc::new(ManualClock::new(NOW)));
    let three_nodes = migrator.monitor().read_limiter().rate();

    migrator.run().await.unwrap();

    // No node heartbeats within the zero timeout, so all are marked down
    assert_eq!(registry.up_count(), 0);
    let read_rate = migrator.monitor().read_limiter().rate();
    assert!(read_rate < three_nodes);
    assert!((read_rate - 100_000.0).abs() < 1e-6);
}

#[tokio::test]
async fn catalog_schedules_without_data_are_logged() {
    let dir = TempDir::new().unwrap();
    let session = Arc::new(LocalStorageSession::new());
    seed_triple(&session, Bucket::TwentyFourHour, 1, NOW - 3 * DAY, (1.0, 0.0, 2.0), None);
    let catalog = Arc::new(StaticScheduleCatalog::new(vec![1, 99]));

    let report = run(
        &session,
        KeySource::Catalog(catalog),
        config(dir.path(), &[Bucket::TwentyFourHour]),
    )
    .await
    .unwrap();

    assert_eq!(report.bucket(Bucket::TwentyFourHour).unwrap().migrated, 2);
    assert_eq!(
        logged(dir.path(), Bucket::TwentyFourHour).await,
        HashSet::from([1, 99])
    );
    assert_eq!(session.aggregates(Bucket::TwentyFourHour).len(), 1);
}

#[tokio::test]
async fn invalid_config_is_rejected_before_running() {
    let dir = TempDir::new().unwrap();
    let session: Arc<dyn StorageSession> = Arc::new(LocalStorageSession::new());
    let bad = MigrationConfig {
        write_group_size: 0,
        ..config(dir.path(), &[Bucket::OneHour])
    };
    assert!(matches!(
        AggregateMigrator::new(session, KeySource::IndexScan, bad),
        Err(Error::Config(_))
    ));
}
