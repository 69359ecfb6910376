//! Schema definitions shared by the migration and query paths

mod metrics;

pub use metrics::{
    AggregateRecord, Bucket, RawSample, RawValue, SampleKind, ScheduleId, AGGREGATE_TABLE,
    INDEX_TABLE, KEYSPACE, RAW_RETENTION_DAYS, RAW_TABLE,
};
