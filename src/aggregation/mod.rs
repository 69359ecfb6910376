//! Aggregation of metric data
//!
//! [`AggregationMerger`] turns legacy per-kind rows into aggregate records
//! during migration. The rollup helpers summarize stored aggregates into
//! coarser slices at query time.

mod merger;
mod rollup;

pub use merger::{AggregationMerger, MergeOutcome, TtlDecision};
pub use rollup::{summarize, AggregateComposite, SummaryAccumulator, TimeSliceBuckets};
