//! Metric data model
//!
//! Legacy storage keeps one row per sample kind per timestamp in a table per
//! bucket. The target schema keeps one aggregate row per timestamp in a single
//! table, discriminated by bucket.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Identifier of one monitored metric time series
pub type ScheduleId = i32;

/// Keyspace holding all metric tables
pub const KEYSPACE: &str = "rhq";
/// Target table for migrated aggregates
pub const AGGREGATE_TABLE: &str = "aggregate_metrics";
/// Raw (unaggregated) data table
pub const RAW_TABLE: &str = "raw_metrics";
/// Legacy secondary index of schedule ids per bucket and time slice
pub const INDEX_TABLE: &str = "metrics_index";

const SECS_PER_DAY: u64 = 24 * 3600;

/// Retention of raw data in days
pub const RAW_RETENTION_DAYS: u64 = 7;

/// Time-resolution tier of aggregated metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    OneHour,
    SixHour,
    TwentyFourHour,
}

impl Bucket {
    /// All buckets, finest resolution first
    pub const ALL: [Bucket; 3] = [Bucket::OneHour, Bucket::SixHour, Bucket::TwentyFourHour];

    /// Name used as the bucket discriminator and in log file names
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::OneHour => "one_hour",
            Bucket::SixHour => "six_hour",
            Bucket::TwentyFourHour => "twenty_four_hour",
        }
    }

    /// Legacy source table for this bucket
    pub fn legacy_table(&self) -> &'static str {
        match self {
            Bucket::OneHour => "one_hour_metrics",
            Bucket::SixHour => "six_hour_metrics",
            Bucket::TwentyFourHour => "twenty_four_hour_metrics",
        }
    }

    /// Retention window of data in this bucket
    pub fn retention(&self) -> Duration {
        let days = match self {
            Bucket::OneHour => 14,
            Bucket::SixHour => 31,
            Bucket::TwentyFourHour => 365,
        };
        Duration::from_secs(days * SECS_PER_DAY)
    }

    /// Width of one time slice in this bucket
    pub fn time_slice(&self) -> Duration {
        let hours = match self {
            Bucket::OneHour => 1,
            Bucket::SixHour => 6,
            Bucket::TwentyFourHour => 24,
        };
        Duration::from_secs(hours * 3600)
    }

    /// Round a millisecond timestamp down to the start of its time slice
    pub fn slice_start(&self, timestamp_ms: i64) -> i64 {
        let width = self.time_slice().as_millis() as i64;
        timestamp_ms.div_euclid(width) * width
    }

    /// Whether `table` is one of the legacy per-bucket tables
    pub fn is_legacy_table(table: &str) -> bool {
        Self::ALL.iter().any(|b| b.legacy_table() == table)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bucket {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "one_hour" | "1h" => Ok(Bucket::OneHour),
            "six_hour" | "6h" => Ok(Bucket::SixHour),
            "twenty_four_hour" | "24h" => Ok(Bucket::TwentyFourHour),
            other => Err(format!(
                "unknown bucket '{}'; expected one of one_hour, six_hour, twenty_four_hour",
                other
            )),
        }
    }
}

/// Kind of a legacy sample row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    Max,
    Min,
    Avg,
}

impl SampleKind {
    /// Decode the legacy type column. Anything other than 0 or 1 is an average.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => SampleKind::Max,
            1 => SampleKind::Min,
            _ => SampleKind::Avg,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            SampleKind::Max => 0,
            SampleKind::Min => 1,
            SampleKind::Avg => 2,
        }
    }
}

/// One legacy measurement row
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub schedule_id: ScheduleId,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub kind: SampleKind,
    pub value: f64,
    /// Remaining time-to-live in seconds; `None` if the row never expires
    pub ttl: Option<i32>,
}

impl RawSample {
    pub fn new(
        schedule_id: ScheduleId,
        timestamp: i64,
        kind: SampleKind,
        value: f64,
        ttl: Option<i32>,
    ) -> Self {
        Self {
            schedule_id,
            timestamp,
            kind,
            value,
            ttl,
        }
    }
}

/// Aggregate row of the target schema
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub schedule_id: ScheduleId,
    pub bucket: Bucket,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    /// Time-to-live in seconds applied on write
    pub ttl: Option<u32>,
}

impl AggregateRecord {
    pub fn new(
        schedule_id: ScheduleId,
        bucket: Bucket,
        timestamp: i64,
        avg: f64,
        min: f64,
        max: f64,
    ) -> Self {
        Self {
            schedule_id,
            bucket,
            timestamp,
            avg,
            min,
            max,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A single stored raw value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawValue {
    pub schedule_id: ScheduleId,
    pub timestamp: i64,
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_windows() {
        assert_eq!(Bucket::OneHour.retention(), Duration::from_secs(14 * 86_400));
        assert_eq!(Bucket::SixHour.retention(), Duration::from_secs(31 * 86_400));
        assert_eq!(
            Bucket::TwentyFourHour.retention(),
            Duration::from_secs(365 * 86_400)
        );
    }

    #[test]
    fn legacy_kind_codes() {
        assert_eq!(SampleKind::from_code(0), SampleKind::Max);
        assert_eq!(SampleKind::from_code(1), SampleKind::Min);
        assert_eq!(SampleKind::from_code(2), SampleKind::Avg);
        assert_eq!(SampleKind::from_code(7), SampleKind::Avg);
        assert_eq!(SampleKind::Min.code(), 1);
    }

    #[test]
    fn bucket_parsing() {
        assert_eq!("one_hour".parse::<Bucket>().unwrap(), Bucket::OneHour);
        assert_eq!("6H".parse::<Bucket>().unwrap(), Bucket::SixHour);
        assert!("weekly".parse::<Bucket>().is_err());
    }

    #[test]
    fn slice_start_rounds_down() {
        let hour = 3_600_000;
        assert_eq!(Bucket::OneHour.slice_start(hour + 5), hour);
        assert_eq!(Bucket::SixHour.slice_start(7 * hour), 6 * hour);
    }

    #[test]
    fn legacy_table_names() {
        assert!(Bucket::is_legacy_table("six_hour_metrics"));
        assert!(!Bucket::is_legacy_table(AGGREGATE_TABLE));
    }
}
