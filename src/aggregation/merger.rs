//! Folding legacy sample rows into aggregate records
//!
//! Legacy tables store one row per (schedule, timestamp, kind). The store
//! returns them ordered by timestamp, so a single pass can collect the
//! max/min/avg triple of each timestamp and emit one [`AggregateRecord`]
//! whenever the timestamp changes.

use crate::schema::{AggregateRecord, Bucket, RawSample, SampleKind, ScheduleId};
use tracing::debug;

/// Result of merging one schedule's rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Records to write, in timestamp order
    pub records: Vec<AggregateRecord>,
    /// Groups missing avg, min or max (absent or NaN)
    pub skipped_incomplete: u64,
    /// Groups older than the bucket retention or with no TTL left
    pub expired: u64,
}

impl MergeOutcome {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// TTL to apply to a migrated record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlDecision {
    /// Write with this TTL in seconds; `None` if the source never expires
    Keep(Option<u32>),
    Expired,
}

/// Accumulates the three kinds of one timestamp
#[derive(Debug, Clone, Copy)]
struct Group {
    schedule_id: ScheduleId,
    timestamp: i64,
    avg: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    ttl: Option<i32>,
}

impl Group {
    fn start(sample: &RawSample) -> Self {
        let mut group = Self {
            schedule_id: sample.schedule_id,
            timestamp: sample.timestamp,
            avg: None,
            min: None,
            max: None,
            ttl: sample.ttl,
        };
        group.add(sample);
        group
    }

    fn add(&mut self, sample: &RawSample) {
        let slot = match sample.kind {
            SampleKind::Max => &mut self.max,
            SampleKind::Min => &mut self.min,
            SampleKind::Avg => &mut self.avg,
        };
        *slot = Some(sample.value);
    }

    fn same_key(&self, sample: &RawSample) -> bool {
        self.schedule_id == sample.schedule_id && self.timestamp == sample.timestamp
    }

    fn complete(&self) -> Option<(f64, f64, f64)> {
        match (self.avg, self.min, self.max) {
            (Some(avg), Some(min), Some(max))
                if !avg.is_nan() && !min.is_nan() && !max.is_nan() =>
            {
                Some((avg, min, max))
            }
            _ => None,
        }
    }
}

/// Folds time-ordered legacy rows of one bucket into aggregate records
#[derive(Debug, Clone, Copy)]
pub struct AggregationMerger {
    bucket: Bucket,
    now_ms: i64,
}

impl AggregationMerger {
    /// `now_ms` is the wall-clock time TTLs are reduced against
    pub fn new(bucket: Bucket, now_ms: i64) -> Self {
        Self { bucket, now_ms }
    }

    pub fn bucket(&self) -> Bucket {
        self.bucket
    }

    /// Merge rows sorted by timestamp. Rows are not re-sorted.
    pub fn merge<I>(&self, samples: I) -> MergeOutcome
    where
        I: IntoIterator<Item = RawSample>,
    {
        let mut outcome = MergeOutcome::default();
        let mut current: Option<Group> = None;

        for sample in samples {
            if let Some(group) = current.as_mut() {
                if group.same_key(&sample) {
                    group.add(&sample);
                    continue;
                }
            }
            if let Some(done) = current.replace(Group::start(&sample)) {
                self.emit(done, &mut outcome);
            }
        }
        if let Some(done) = current {
            self.emit(done, &mut outcome);
        }
        outcome
    }

    fn emit(&self, group: Group, outcome: &mut MergeOutcome) {
        let Some((avg, min, max)) = group.complete() else {
            debug!(
                bucket = %self.bucket,
                schedule_id = group.schedule_id,
                timestamp = group.timestamp,
                "Partial metric will not be migrated"
            );
            outcome.skipped_incomplete += 1;
            return;
        };
        match self.ttl_for(group.timestamp, group.ttl) {
            TtlDecision::Keep(ttl) => outcome.records.push(AggregateRecord {
                schedule_id: group.schedule_id,
                bucket: self.bucket,
                timestamp: group.timestamp,
                avg,
                min,
                max,
                ttl,
            }),
            TtlDecision::Expired => outcome.expired += 1,
        }
    }

    /// Reduce a source TTL by the seconds elapsed since `timestamp`
    pub fn ttl_for(&self, timestamp: i64, original_ttl: Option<i32>) -> TtlDecision {
        let elapsed_secs = (self.now_ms - timestamp).max(0) / 1000;
        if elapsed_secs as u64 > self.bucket.retention().as_secs() {
            return TtlDecision::Expired;
        }
        match original_ttl {
            None => TtlDecision::Keep(None),
            Some(ttl) => {
                let remaining = i64::from(ttl) - elapsed_secs;
                if remaining <= 0 {
                    TtlDecision::Expired
                } else {
                    TtlDecision::Keep(Some(remaining.min(i64::from(u32::MAX)) as u32))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ts: i64, kind: SampleKind, value: f64, ttl: i32) -> RawSample {
        RawSample::new(42, ts, kind, value, Some(ttl))
    }

    #[test]
    fn merges_triples_and_drops_partial_groups() {
        let merger = AggregationMerger::new(Bucket::OneHour, 2_000);
        let outcome = merger.merge(vec![
            row(1000, SampleKind::Max, 8.0, 3600),
            row(1000, SampleKind::Min, 1.0, 3600),
            row(1000, SampleKind::Avg, 3.0, 3600),
            row(2000, SampleKind::Max, 10.0, 3600),
            row(2000, SampleKind::Avg, 4.0, 3600),
        ]);

        assert_eq!(outcome.records.len(), 1);
        let record = outcome.records[0];
        assert_eq!(record.timestamp, 1000);
        assert_eq!((record.avg, record.min, record.max), (3.0, 1.0, 8.0));
        assert_eq!(outcome.skipped_incomplete, 1);
        assert_eq!(outcome.expired, 0);
    }

    #[test]
    fn last_group_is_emitted() {
        let merger = AggregationMerger::new(Bucket::SixHour, 0);
        let outcome = merger.merge(vec![
            row(0, SampleKind::Max, 2.0, 60),
            row(0, SampleKind::Min, 1.0, 60),
            row(0, SampleKind::Avg, 1.5, 60),
        ]);
        assert_eq!(outcome.records.len(), 1);
    }

    #[test]
    fn nan_value_makes_group_incomplete() {
        let merger = AggregationMerger::new(Bucket::OneHour, 0);
        let outcome = merger.merge(vec![
            row(0, SampleKind::Max, 2.0, 60),
            row(0, SampleKind::Min, f64::NAN, 60),
            row(0, SampleKind::Avg, 1.5, 60),
        ]);
        assert!(outcome.is_empty());
        assert_eq!(outcome.skipped_incomplete, 1);
    }

    #[test]
    fn ttl_reduced_by_elapsed_time() {
        let merger = AggregationMerger::new(Bucket::OneHour, 100_000);
        assert_eq!(merger.ttl_for(0, Some(1000)), TtlDecision::Keep(Some(900)));
        assert_eq!(merger.ttl_for(0, Some(100)), TtlDecision::Expired);
        assert_eq!(merger.ttl_for(0, None), TtlDecision::Keep(None));
    }

    #[test]
    fn rows_older_than_retention_expire() {
        let fifteen_days_ms = 15 * 86_400 * 1000;
        let merger = AggregationMerger::new(Bucket::OneHour, fifteen_days_ms);
        assert_eq!(merger.ttl_for(0, Some(i32::MAX)), TtlDecision::Expired);

        let merger = AggregationMerger::new(Bucket::SixHour, fifteen_days_ms);
        assert!(matches!(merger.ttl_for(0, Some(i32::MAX)), TtlDecision::Keep(Some(_))));
    }

    #[test]
    fn ttl_taken_from_first_row_of_group() {
        let merger = AggregationMerger::new(Bucket::OneHour, 0);
        let outcome = merger.merge(vec![
            row(0, SampleKind::Max, 2.0, 500),
            row(0, SampleKind::Min, 1.0, 400),
            row(0, SampleKind::Avg, 1.5, 300),
        ]);
        assert_eq!(outcome.records[0].ttl, Some(500));
    }
}
