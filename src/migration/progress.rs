//! Per-bucket counters and the periodic progress log

use crate::schema::Bucket;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Counters of one bucket's migration, shared by every task of the run
#[derive(Debug)]
pub struct BucketProgress {
    bucket: Bucket,
    candidates: AtomicU64,
    already_migrated: AtomicU64,
    migrated: AtomicU64,
    records_written: AtomicU64,
    skipped_incomplete: AtomicU64,
    skipped_expired: AtomicU64,
    read_failures: AtomicU64,
    write_failures: AtomicU64,
    remaining: AtomicU64,
}

impl BucketProgress {
    pub fn new(bucket: Bucket) -> Self {
        Self {
            bucket,
            candidates: AtomicU64::new(0),
            already_migrated: AtomicU64::new(0),
            migrated: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            skipped_incomplete: AtomicU64::new(0),
            skipped_expired: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            remaining: AtomicU64::new(0),
        }
    }

    pub fn bucket(&self) -> Bucket {
        self.bucket
    }

    /// Record the candidate set and what the log already covers
    pub fn set_work(&self, candidates: u64, already_migrated: u64, remaining: u64) {
        self.candidates.store(candidates, Ordering::Relaxed);
        self.already_migrated.store(already_migrated, Ordering::Relaxed);
        self.remaining.store(remaining, Ordering::Relaxed);
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Relaxed)
    }

    pub fn schedule_migrated(&self) {
        self.migrated.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn records_written(&self, n: u64) {
        self.records_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn records_skipped(&self, incomplete: u64, expired: u64) {
        self.skipped_incomplete.fetch_add(incomplete, Ordering::Relaxed);
        self.skipped_expired.fetch_add(expired, Ordering::Relaxed);
    }

    pub fn read_failed(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_failed(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BucketReport {
        BucketReport {
            bucket: self.bucket,
            candidates: self.candidates.load(Ordering::Relaxed),
            already_migrated: self.already_migrated.load(Ordering::Relaxed),
            migrated: self.migrated.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            skipped_incomplete: self.skipped_incomplete.load(Ordering::Relaxed),
            skipped_expired: self.skipped_expired.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            remaining: self.remaining.load(Ordering::Relaxed),
        }
    }
}

/// Final or intermediate counters of one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketReport {
    pub bucket: Bucket,
    /// Schedules found for the bucket
    pub candidates: u64,
    /// Candidates already in the migration log at start
    pub already_migrated: u64,
    /// Schedules migrated during this run
    pub migrated: u64,
    pub records_written: u64,
    pub skipped_incomplete: u64,
    pub skipped_expired: u64,
    pub read_failures: u64,
    pub write_failures: u64,
    pub remaining: u64,
}

/// Logs remaining work and error counters on an interval until shutdown
pub async fn report_progress(
    buckets: Vec<Arc<BucketProgress>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for progress in &buckets {
                    let snapshot = progress.snapshot();
                    info!(
                        bucket = %snapshot.bucket,
                        remaining = snapshot.remaining,
                        migrated = snapshot.migrated,
                        read_failures = snapshot.read_failures,
                        write_failures = snapshot.write_failures,
                        "Migration progress"
                    );
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_counts_down_and_saturates() {
        let progress = BucketProgress::new(Bucket::OneHour);
        progress.set_work(3, 1, 2);
        progress.schedule_migrated();
        progress.schedule_migrated();
        progress.schedule_migrated();

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.remaining, 0);
        assert_eq!(snapshot.migrated, 3);
        assert_eq!(snapshot.already_migrated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(report_progress(
            vec![Arc::new(BucketProgress::new(Bucket::SixHour))],
            Duration::from_secs(30),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(65)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
