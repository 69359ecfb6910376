//! Query-time reads of metric data
//!
//! The [`MetricsReader`] picks the finest table still holding data for the
//! requested range (by age of the range start) and downsamples what it reads
//! into equal time slices.

mod reader;

pub use reader::{select_source, DataSource, MetricsReader};
