//! # Rollup Migrator
//!
//! Moves pre-aggregated metric data from the legacy per-bucket tables
//! (`one_hour_metrics`, `six_hour_metrics`, `twenty_four_hour_metrics`) into
//! one aggregate table keyed by schedule, bucket and time slice.
//!
//! ## Key Features
//!
//! - **Resumable**: completed schedules are recorded per bucket in an
//!   append-only log; a restarted run skips them
//! - **Throttled**: reads and writes pass through warm-up rate limiters sized
//!   to the live cluster and backed off on failures
//! - **Complete**: failed reads are requeued and failed writes retried within
//!   the run; a run with work left over fails instead of reporting success
//!
//! ## Architecture
//!
//! - **Migration**: scans candidate keys, reads legacy rows, merges them into
//!   aggregate records and writes them in batches
//! - **Query**: reads data back at query time, choosing the table by data age
//! - **Maintenance**: named server operations run as ordered job steps

pub mod aggregation;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod maintenance;
pub mod migration;
pub mod query;
pub mod rate_limit;
pub mod schema;
pub mod store;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::aggregation::{AggregateComposite, AggregationMerger};
    pub use crate::config::{ComponentFactory, MigrationConfig};
    pub use crate::migration::{AggregateMigrator, KeySource, MigrationReport};
    pub use crate::query::MetricsReader;
    pub use crate::schema::{AggregateRecord, Bucket, RawSample, SampleKind, ScheduleId};
    pub use crate::store::{LocalStorageSession, StorageSession};
    pub use crate::{Error, Result};
}
