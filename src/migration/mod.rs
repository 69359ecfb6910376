//! Migration of legacy per-bucket aggregate tables
//!
//! The [`AggregateMigrator`] moves every schedule's data from the
//! `one_hour`, `six_hour` and `twenty_four_hour` tables into the unified
//! aggregate table. Completion is tracked per bucket in a [`MigrationLog`],
//! so an interrupted run resumes where it stopped.

mod log;
mod migrator;
mod progress;
mod scanner;
pub mod telemetry;
mod tracker;

pub use log::{log_path, MigrationLog};
pub use migrator::{drop_legacy_tables, AggregateMigrator, KeySource, MigrationReport};
pub use progress::{report_progress, BucketProgress, BucketReport};
pub use scanner::KeyScanner;
pub use tracker::TaskTracker;
