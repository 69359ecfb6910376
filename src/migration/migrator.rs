//! Batch migration of the legacy bucket tables into the aggregate table
//!
//! Per bucket, the residual work set (candidates minus the migration log) is
//! processed in fixed-size batches: rate-gated reads, a merge per schedule,
//! then rate-gated write groups. Failed reads go back on the queue of the
//! same run; failed writes are retried until they succeed or the run stops.
//! A schedule counts as migrated only once all of its records are written.

use super::log::MigrationLog;
use super::progress::{report_progress, BucketProgress, BucketReport};
use super::scanner::KeyScanner;
use super::telemetry;
use super::tracker::TaskTracker;
use crate::aggregation::AggregationMerger;
use crate::clock::{BoundedClock, Clock};
use crate::config::MigrationConfig;
use crate::rate_limit::{RateLimiter, RateMonitor};
use crate::schema::{AggregateRecord, Bucket, RawSample, SampleKind, ScheduleId, KEYSPACE};
use crate::store::{
    BoundStatement, PreparedStatement, QueryTemplate, Row, ScheduleCatalog, StorageSession, Value,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Write batches a bucket may have in flight while it keeps reading
const MAX_WRITE_BATCHES_IN_FLIGHT: usize = 2;

/// Where candidate schedule ids come from
#[derive(Clone)]
pub enum KeySource {
    /// Every numeric measurement schedule known to the relational catalog.
    /// Used for the first migration generation.
    Catalog(Arc<dyn ScheduleCatalog>),
    /// Schedules found in the legacy index of each bucket
    IndexScan,
}

/// Outcome of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub buckets: Vec<BucketReport>,
    /// Legacy tables dropped after the run
    pub dropped_tables: Vec<String>,
}

impl MigrationReport {
    pub fn bucket(&self, bucket: Bucket) -> Option<&BucketReport> {
        self.buckets.iter().find(|r| r.bucket == bucket)
    }
}

/// Drives the migration of every configured bucket
pub struct AggregateMigrator {
    session: Arc<dyn StorageSession>,
    key_source: KeySource,
    config: MigrationConfig,
    clock: Arc<dyn Clock>,
    monitor: Arc<RateMonitor>,
}

impl AggregateMigrator {
    pub fn new(
        session: Arc<dyn StorageSession>,
        key_source: KeySource,
        config: MigrationConfig,
    ) -> Result<Self> {
        config.validate()?;
        let up_nodes = session.node_registry().up_count();
        let monitor = Arc::new(RateMonitor::new(
            config.read_limit,
            config.write_limit,
            config.increase_per_node,
            up_nodes,
            config.warmup,
            config.monitor.clone(),
        ));
        Ok(Self {
            session,
            key_source,
            config,
            clock: Arc::new(BoundedClock::default()),
            monitor,
        })
    }

    /// Use `clock` for TTL reduction
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn monitor(&self) -> Arc<RateMonitor> {
        self.monitor.clone()
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Migrate every configured bucket.
    ///
    /// Fails with [`Error::Incomplete`] if any bucket still has schedules
    /// left when the run ends; running again picks up where this run stopped.
    pub async fn run(&self) -> Result<MigrationReport> {
        let started_at = self.clock.now();
        let started = Instant::now();
        let deadline = self.config.max_run_duration.map(|d| started + d);
        let shutdown = CancellationToken::new();

        info!(
            buckets = ?self.config.buckets,
            concurrent = self.config.concurrent_buckets,
            read_rate = self.monitor.read_limiter().rate(),
            write_rate = self.monitor.write_limiter().rate(),
            "Starting aggregate metrics migration"
        );

        let registry = self.session.node_registry();
        let topology = registry.subscribe();
        let monitor_task = tokio::spawn(self.monitor.clone().run(topology, shutdown.child_token()));
        let health_checks = tokio::spawn({
            let shutdown = shutdown.child_token();
            async move { registry.run_health_checks(shutdown).await }
        });

        let progress: Vec<Arc<BucketProgress>> = self
            .config
            .buckets
            .iter()
            .map(|&bucket| Arc::new(BucketProgress::new(bucket)))
            .collect();
        let reporter = tokio::spawn(report_progress(
            progress.clone(),
            self.config.progress_interval,
            shutdown.child_token(),
        ));

        let result = self.migrate_buckets(&progress, deadline).await;

        shutdown.cancel();
        let _ = monitor_task.await;
        let _ = health_checks.await;
        let _ = reporter.await;
        result?;

        let buckets: Vec<BucketReport> = progress.iter().map(|p| p.snapshot()).collect();
        let outstanding: Vec<(Bucket, u64)> = buckets
            .iter()
            .filter(|r| r.remaining > 0)
            .map(|r| (r.bucket, r.remaining))
            .collect();
        if !outstanding.is_empty() {
            error!(?outstanding, "Aggregate metrics migration did not complete");
            return Err(Error::Incomplete { outstanding });
        }

        let dropped_tables = if self.config.drop_legacy_tables {
            drop_tables(self.session.as_ref()).await?
        } else {
            Vec::new()
        };

        let report = MigrationReport {
            started_at,
            elapsed: started.elapsed(),
            buckets,
            dropped_tables,
        };
        info!(
            elapsed_ms = report.elapsed.as_millis() as u64,
            dropped_tables = ?report.dropped_tables,
            "Aggregate metrics migration finished"
        );
        Ok(report)
    }

    async fn migrate_buckets(
        &self,
        progress: &[Arc<BucketProgress>],
        deadline: Option<Instant>,
    ) -> Result<()> {
        let statements =
            Arc::new(Statements::prepare(self.session.as_ref(), &self.config.buckets).await?);
        let candidates = match &self.key_source {
            KeySource::Catalog(catalog) => {
                let ids: BTreeSet<ScheduleId> =
                    catalog.list_numeric_schedule_ids().await?.into_iter().collect();
                info!(schedules = ids.len(), "Loaded numeric schedules from catalog");
                Some(Arc::new(ids))
            }
            KeySource::IndexScan => None,
        };

        let run_tracker = Arc::new(TaskTracker::new());
        let mut tasks = JoinSet::new();
        let mut errors = Vec::new();

        for bucket_progress in progress {
            let migration = Arc::new(BucketMigration {
                bucket: bucket_progress.bucket(),
                session: self.session.clone(),
                statements: statements.clone(),
                read_limiter: self.monitor.read_limiter(),
                write_limiter: self.monitor.write_limiter(),
                monitor: self.monitor.clone(),
                progress: bucket_progress.clone(),
                run_tracker: run_tracker.clone(),
                candidates: candidates.clone(),
                clock: self.clock.clone(),
                data_dir: self.config.data_dir.clone(),
                batch_size: self.config.batch_size,
                write_group_size: self.config.write_group_size,
                index_page_size: self.config.index_page_size,
                read_page_size: self.config.read_page_size,
                retry_backoff: self.config.retry_backoff,
                deadline,
            });
            run_tracker.add_task();
            if self.config.concurrent_buckets {
                let tracker = run_tracker.clone();
                tasks.spawn(async move {
                    let bucket = migration.bucket;
                    let result = migration.run().await;
                    settle(&tracker, bucket, &result);
                    result
                });
            } else {
                let bucket = migration.bucket;
                let result = migration.run().await;
                settle(&run_tracker, bucket, &result);
                if let Err(e) = result {
                    errors.push(e);
                    break;
                }
            }
        }
        run_tracker.finished_scheduling_tasks();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => {
                    run_tracker.abort(format!("bucket migration task failed: {}", e));
                    errors.push(e.into());
                }
            }
        }
        let waited = run_tracker.wait_for_tasks_to_finish().await;

        // Report the failure that caused the abort, not the buckets it stopped
        let root_cause = errors
            .iter()
            .position(|e| !matches!(e, Error::Aborted(_)))
            .unwrap_or(0);
        if errors.is_empty() {
            waited
        } else {
            Err(errors.swap_remove(root_cause))
        }
    }
}

fn settle(run_tracker: &TaskTracker, bucket: Bucket, result: &Result<()>) {
    match result {
        Ok(()) => run_tracker.finished_task(),
        Err(e) => {
            error!(bucket = %bucket, error = %e, "Bucket migration failed, aborting run");
            run_tracker.abort(format!("migration of {} data failed: {}", bucket, e));
        }
    }
}

/// Drop the legacy tables once nothing in them is left to migrate.
///
/// Every legacy table that still exists is checked first: its index is
/// scanned and compared with the bucket's migration log in `data_dir`. While
/// any schedule is missing from a log, nothing is dropped and the call fails
/// with [`Error::Incomplete`]. Returns the names of the dropped tables.
pub async fn drop_legacy_tables(
    session: Arc<dyn StorageSession>,
    data_dir: &Path,
    index_page_size: usize,
) -> Result<Vec<String>> {
    let tables = session.list_tables(KEYSPACE).await?;
    let scanner = KeyScanner::new(session.clone(), index_page_size);
    let mut outstanding = Vec::new();
    for bucket in Bucket::ALL {
        if !tables.iter().any(|t| t == bucket.legacy_table()) {
            continue;
        }
        let candidates = scanner.scan_keys(bucket).await?;
        let log = MigrationLog::open(data_dir, bucket).await?;
        let migrated = log.read().await;
        log.close().await?;
        let migrated = migrated?;
        let remaining = candidates.iter().filter(|id| !migrated.contains(id)).count();
        if remaining > 0 {
            outstanding.push((bucket, remaining as u64));
        }
    }
    if !outstanding.is_empty() {
        warn!(?outstanding, "Legacy tables still hold unmigrated schedules, keeping them");
        return Err(Error::Incomplete { outstanding });
    }
    drop_tables(session.as_ref()).await
}

async fn drop_tables(session: &dyn StorageSession) -> Result<Vec<String>> {
    let tables = session.list_tables(KEYSPACE).await?;
    let mut dropped = Vec::new();
    for table in tables.into_iter().filter(|t| Bucket::is_legacy_table(t)) {
        info!(keyspace = KEYSPACE, table = %table, "Dropping legacy table");
        session.drop_table(KEYSPACE, &table).await?;
        dropped.push(table);
    }
    Ok(dropped)
}

/// Statements prepared once per run
struct Statements {
    insert: PreparedStatement,
    find_legacy: HashMap<Bucket, PreparedStatement>,
}

impl Statements {
    async fn prepare(session: &dyn StorageSession, buckets: &[Bucket]) -> Result<Self> {
        let insert = session.prepare(QueryTemplate::InsertAggregate).await?;
        let mut find_legacy = HashMap::new();
        for &bucket in buckets {
            let prepared = session
                .prepare(QueryTemplate::FindLegacyRows(bucket))
                .await?;
            find_legacy.insert(bucket, prepared);
        }
        Ok(Self {
            insert,
            find_legacy,
        })
    }

    fn find_legacy(&self, bucket: Bucket, schedule_id: ScheduleId) -> Result<BoundStatement> {
        self.find_legacy
            .get(&bucket)
            .ok_or_else(|| Error::Internal(format!("no legacy read prepared for {}", bucket)))?
            .bind(vec![Value::Int(schedule_id)])
    }

    fn insert(&self, record: &AggregateRecord) -> Result<BoundStatement> {
        let ttl = record
            .ttl
            .map(|t| Value::Int(t.min(i32::MAX as u32) as i32))
            .unwrap_or(Value::Null);
        self.insert.bind(vec![
            Value::Int(record.schedule_id),
            Value::Text(record.bucket.as_str().to_string()),
            Value::Timestamp(record.timestamp),
            Value::Double(record.avg),
            Value::Double(record.max),
            Value::Double(record.min),
            ttl,
        ])
    }
}

/// Every legacy row of a schedule, following paging state to the end.
/// Pages after the first are rate-gated like any other read.
async fn read_legacy_rows(
    session: &dyn StorageSession,
    statement: BoundStatement,
    page_size: usize,
    limiter: &RateLimiter,
) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    let mut paging_state = None;
    loop {
        let page = session
            .execute(
                statement
                    .clone()
                    .with_fetch_size(page_size)
                    .with_paging_state(paging_state.take()),
            )
            .await?;
        rows.extend(page.rows);
        match page.paging_state {
            Some(next) => {
                limiter.acquire().await;
                paging_state = Some(next);
            }
            None => return Ok(rows),
        }
    }
}

fn decode_samples(schedule_id: ScheduleId, rows: &[Row]) -> Result<Vec<RawSample>> {
    rows.iter()
        .map(|row| {
            Ok(RawSample::new(
                schedule_id,
                row.get_timestamp(0)?,
                SampleKind::from_code(row.get_int(1)?),
                row.get_double(2)?,
                row.get_opt_int(3)?,
            ))
        })
        .collect()
}

type ReadResults = (Vec<(ScheduleId, Vec<RawSample>)>, Vec<ScheduleId>);

/// Migration of one bucket within a run
struct BucketMigration {
    bucket: Bucket,
    session: Arc<dyn StorageSession>,
    statements: Arc<Statements>,
    read_limiter: Arc<RateLimiter>,
    write_limiter: Arc<RateLimiter>,
    monitor: Arc<RateMonitor>,
    progress: Arc<BucketProgress>,
    run_tracker: Arc<TaskTracker>,
    candidates: Option<Arc<BTreeSet<ScheduleId>>>,
    clock: Arc<dyn Clock>,
    data_dir: PathBuf,
    batch_size: usize,
    write_group_size: usize,
    index_page_size: usize,
    read_page_size: usize,
    retry_backoff: Duration,
    deadline: Option<Instant>,
}

impl BucketMigration {
    async fn run(self: Arc<Self>) -> Result<()> {
        let bucket = self.bucket;
        let log = Arc::new(MigrationLog::open(&self.data_dir, bucket).await?);
        let migrated = log.read().await?;

        let candidates = match &self.candidates {
            Some(ids) => ids.as_ref().clone(),
            None => {
                KeyScanner::new(self.session.clone(), self.index_page_size)
                    .scan_keys(bucket)
                    .await?
            }
        };
        let mut residual: VecDeque<ScheduleId> = candidates
            .iter()
            .copied()
            .filter(|id| !migrated.contains(id))
            .collect();
        let already_migrated = candidates.len() - residual.len();
        self.progress.set_work(
            candidates.len() as u64,
            already_migrated as u64,
            residual.len() as u64,
        );
        info!(
            bucket = %bucket,
            candidates = candidates.len(),
            already_migrated,
            remaining = residual.len(),
            "Starting migration of bucket"
        );

        let tracker = Arc::new(TaskTracker::new());
        let mut writers: JoinSet<Result<()>> = JoinSet::new();
        let mut failure: Option<Error> = None;

        while !residual.is_empty() && failure.is_none() {
            if let Some(reason) = self.stop_reason() {
                warn!(bucket = %bucket, remaining = residual.len(), reason, "Stopping bucket migration");
                break;
            }

            let take = residual.len().min(self.batch_size);
            let batch: Vec<ScheduleId> = residual.drain(..take).collect();
            let (reads, failed) = match self.read_batch(&batch).await {
                Ok(results) => results,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            let all_failed = reads.is_empty() && !failed.is_empty();
            residual.extend(failed);

            let merger = AggregationMerger::new(bucket, self.clock.now_millis());
            let mut pending = Vec::with_capacity(reads.len());
            for (schedule_id, samples) in reads {
                let outcome = merger.merge(samples);
                self.progress
                    .records_skipped(outcome.skipped_incomplete, outcome.expired);
                telemetry::record_records_skipped(bucket, "incomplete", outcome.skipped_incomplete);
                telemetry::record_records_skipped(bucket, "expired", outcome.expired);
                tracker.add_task();
                pending.push((schedule_id, outcome.records));
            }

            if !pending.is_empty() {
                while writers.len() >= MAX_WRITE_BATCHES_IN_FLIGHT {
                    if let Some(joined) = writers.join_next().await {
                        if let Err(e) = flatten_join(joined) {
                            failure = Some(e);
                        }
                    }
                }
                let this = self.clone();
                let log = log.clone();
                let tracker = tracker.clone();
                writers.spawn(async move { this.write_batch(pending, &log, &tracker).await });
            }

            if all_failed {
                tokio::time::sleep(self.retry_backoff).await;
            }
        }
        tracker.finished_scheduling_tasks();

        while let Some(joined) = writers.join_next().await {
            if let Err(e) = flatten_join(joined) {
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = &failure {
            tracker.abort(e.to_string());
        }

        let waited = tracker.wait_for_tasks_to_finish().await;
        let closed = log.close().await;
        if let Some(e) = failure {
            return Err(e);
        }
        waited?;
        closed?;

        if self.run_tracker.is_aborted() {
            return Err(Error::Aborted(format!(
                "migration of {} data stopped because the run was aborted",
                bucket
            )));
        }
        info!(
            bucket = %bucket,
            remaining = self.progress.remaining(),
            "Finished migration of bucket"
        );
        Ok(())
    }

    fn stop_reason(&self) -> Option<&'static str> {
        if self.run_tracker.is_aborted() {
            Some("run aborted")
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some("run time limit reached")
        } else {
            None
        }
    }

    /// Read every schedule of a batch. Transient failures are returned for
    /// requeueing; anything else fails the bucket.
    async fn read_batch(&self, batch: &[ScheduleId]) -> Result<ReadResults> {
        let mut reads = JoinSet::new();
        let mut in_flight: HashSet<ScheduleId> = HashSet::with_capacity(batch.len());
        for &schedule_id in batch {
            let statement = self.statements.find_legacy(self.bucket, schedule_id)?;
            self.read_limiter.acquire().await;
            let session = self.session.clone();
            let limiter = self.read_limiter.clone();
            let page_size = self.read_page_size;
            in_flight.insert(schedule_id);
            reads.spawn(async move {
                let rows =
                    read_legacy_rows(session.as_ref(), statement, page_size, &limiter).await;
                (schedule_id, rows)
            });
        }

        let mut succeeded = Vec::with_capacity(batch.len());
        let mut failed = Vec::new();
        while let Some(joined) = reads.join_next().await {
            let Ok((schedule_id, result)) = joined else {
                continue;
            };
            in_flight.remove(&schedule_id);
            match result.and_then(|rows| decode_samples(schedule_id, &rows)) {
                Ok(samples) => {
                    self.monitor.request_succeeded();
                    if samples.is_empty() {
                        debug!(bucket = %self.bucket, schedule_id, "No data to migrate");
                    }
                    succeeded.push((schedule_id, samples));
                }
                Err(e) if e.is_transient() => {
                    self.monitor.request_failed();
                    self.progress.read_failed();
                    telemetry::record_read_failure(self.bucket);
                    warn!(bucket = %self.bucket, schedule_id, error = %e, "Read failed, requeueing schedule");
                    failed.push(schedule_id);
                }
                Err(e) => return Err(e),
            }
        }
        // Reads whose task died are retried like failed ones
        failed.extend(in_flight);
        Ok((succeeded, failed))
    }

    /// Write the records of a batch, retrying failed groups until they
    /// succeed or the run stops
    async fn write_batch(
        &self,
        pending: Vec<(ScheduleId, Vec<AggregateRecord>)>,
        log: &MigrationLog,
        tracker: &TaskTracker,
    ) -> Result<()> {
        let mut unwritten = pending;
        loop {
            let mut round = JoinSet::new();
            let mut dispatched: HashSet<ScheduleId> = HashSet::new();
            for (schedule_id, records) in std::mem::take(&mut unwritten) {
                if records.is_empty() {
                    self.mark_migrated(schedule_id, log, tracker).await;
                    continue;
                }
                for group in records.chunks(self.write_group_size) {
                    let statements = group
                        .iter()
                        .map(|r| self.statements.insert(r))
                        .collect::<Result<Vec<_>>>()?;
                    self.write_limiter.acquire_permits(group.len() as u32).await;
                    dispatched.insert(schedule_id);
                    let session = self.session.clone();
                    let records = group.to_vec();
                    round.spawn(async move {
                        let result = session.execute_batch(statements).await;
                        (schedule_id, records, result)
                    });
                }
            }

            let mut failed: HashMap<ScheduleId, Vec<AggregateRecord>> = HashMap::new();
            while let Some(joined) = round.join_next().await {
                let (schedule_id, records, result) = joined?;
                match result {
                    Ok(()) => {
                        self.monitor.request_succeeded();
                        self.progress.records_written(records.len() as u64);
                        telemetry::record_records_written(self.bucket, records.len() as u64);
                    }
                    Err(e) if e.is_transient() => {
                        self.monitor.request_failed();
                        self.progress.write_failed();
                        telemetry::record_write_failure(self.bucket);
                        warn!(
                            bucket = %self.bucket,
                            schedule_id,
                            records = records.len(),
                            error = %e,
                            "Write failed, will retry"
                        );
                        failed.entry(schedule_id).or_default().extend(records);
                    }
                    Err(e) => return Err(e),
                }
            }

            for schedule_id in dispatched {
                if !failed.contains_key(&schedule_id) {
                    self.mark_migrated(schedule_id, log, tracker).await;
                }
            }
            if failed.is_empty() {
                return Ok(());
            }
            if let Some(reason) = self.stop_reason() {
                warn!(
                    bucket = %self.bucket,
                    schedules = failed.len(),
                    reason,
                    "Abandoning failed writes"
                );
                for _ in 0..failed.len() {
                    tracker.finished_task();
                }
                return Ok(());
            }
            tokio::time::sleep(self.retry_backoff).await;
            unwritten = failed.into_iter().collect();
        }
    }

    async fn mark_migrated(&self, schedule_id: ScheduleId, log: &MigrationLog, tracker: &TaskTracker) {
        self.progress.schedule_migrated();
        if let Err(e) = log.write(schedule_id).await {
            warn!(
                bucket = %self.bucket,
                schedule_id,
                error = %e,
                "Could not record migrated schedule; it will be migrated again next run"
            );
        }
        telemetry::record_migration_completed(self.bucket);
        tracker.finished_task();
        debug!(bucket = %self.bucket, schedule_id, "Schedule migrated");
    }
}

fn flatten_join(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined?
}
