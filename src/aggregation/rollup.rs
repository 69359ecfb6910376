//! Query-time rollups of stored data
//!
//! Coarser summaries of already-aggregated rows take the minimum of mins, the
//! maximum of maxes and the arithmetic mean of averages. The mean of means is
//! not weighted by sample counts; callers rely on exactly this number.

use crate::schema::AggregateRecord;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// avg/min/max summary of one time slice. NaN fields mean "no data".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateComposite {
    /// Start of the slice in epoch milliseconds
    pub timestamp: i64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl AggregateComposite {
    pub fn empty(timestamp: i64) -> Self {
        Self {
            timestamp,
            avg: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.avg.is_nan()
    }
}

/// Running mean-of-means with min/max tracking
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryAccumulator {
    sum: f64,
    count: u64,
    min: Option<f64>,
    max: Option<f64>,
}

impl SummaryAccumulator {
    /// Add one already-aggregated triple
    pub fn add_aggregate(&mut self, avg: f64, min: f64, max: f64) {
        self.sum += avg;
        self.count += 1;
        self.min = Some(self.min.map_or(min, |m| m.min(min)));
        self.max = Some(self.max.map_or(max, |m| m.max(max)));
    }

    /// Add one raw value
    pub fn add_value(&mut self, value: f64) {
        self.add_aggregate(value, value, value);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn finish(&self, timestamp: i64) -> AggregateComposite {
        match (self.count, self.min, self.max) {
            (0, _, _) | (_, None, _) | (_, _, None) => AggregateComposite::empty(timestamp),
            (count, Some(min), Some(max)) => AggregateComposite {
                timestamp,
                avg: self.sum / count as f64,
                min,
                max,
            },
        }
    }
}

/// Summarize aggregate records into one composite
pub fn summarize<'a, I>(timestamp: i64, records: I) -> AggregateComposite
where
    I: IntoIterator<Item = &'a AggregateRecord>,
{
    let mut acc = SummaryAccumulator::default();
    for record in records {
        acc.add_aggregate(record.avg, record.min, record.max);
    }
    acc.finish(timestamp)
}

/// Splits `[begin, end)` into equal time slices and accumulates points into them
#[derive(Debug, Clone)]
pub struct TimeSliceBuckets {
    begin: i64,
    end: i64,
    interval: i64,
    slices: Vec<SummaryAccumulator>,
}

impl TimeSliceBuckets {
    pub fn new(begin: i64, end: i64, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(Error::InvalidArgument(
                "number of data points must be positive".to_string(),
            ));
        }
        if end <= begin {
            return Err(Error::InvalidArgument(format!(
                "end time {} is not after begin time {}",
                end, begin
            )));
        }
        let interval = ((end - begin) / count as i64).max(1);
        Ok(Self {
            begin,
            end,
            interval,
            slices: vec![SummaryAccumulator::default(); count],
        })
    }

    fn slot(&mut self, timestamp: i64) -> Option<&mut SummaryAccumulator> {
        if timestamp < self.begin || timestamp >= self.end {
            return None;
        }
        let last = self.slices.len() - 1;
        let idx = (((timestamp - self.begin) / self.interval) as usize).min(last);
        self.slices.get_mut(idx)
    }

    /// Insert an aggregated point. Points outside the range are ignored.
    pub fn insert_aggregate(&mut self, timestamp: i64, avg: f64, min: f64, max: f64) {
        if let Some(slot) = self.slot(timestamp) {
            slot.add_aggregate(avg, min, max);
        }
    }

    pub fn insert_value(&mut self, timestamp: i64, value: f64) {
        if let Some(slot) = self.slot(timestamp) {
            slot.add_value(value);
        }
    }

    /// One composite per slice, in time order; empty slices are NaN
    pub fn finish(self) -> Vec<AggregateComposite> {
        let (begin, interval) = (self.begin, self.interval);
        self.slices
            .iter()
            .enumerate()
            .map(|(i, acc)| acc.finish(begin + i as i64 * interval))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Bucket;

    #[test]
    fn mean_of_means_is_unweighted() {
        let records = [
            AggregateRecord::new(1, Bucket::OneHour, 0, 2.0, 1.0, 3.0),
            AggregateRecord::new(1, Bucket::OneHour, 1, 10.0, 0.5, 20.0),
            AggregateRecord::new(1, Bucket::OneHour, 2, 3.0, 2.0, 4.0),
        ];
        let summary = summarize(0, &records);
        assert_eq!(summary.avg, 5.0);
        assert_eq!(summary.min, 0.5);
        assert_eq!(summary.max, 20.0);
    }

    #[test]
    fn empty_summary_is_nan() {
        let summary = summarize(7, std::iter::empty::<&AggregateRecord>());
        assert!(summary.is_empty());
        assert!(summary.min.is_nan() && summary.max.is_nan());
        assert_eq!(summary.timestamp, 7);
    }

    #[test]
    fn slices_partition_range() {
        let mut buckets = TimeSliceBuckets::new(0, 100, 4).unwrap();
        buckets.insert_value(0, 1.0);
        buckets.insert_value(10, 3.0);
        buckets.insert_value(60, 5.0);
        buckets.insert_value(99, 7.0);
        buckets.insert_value(100, 1_000.0);

        let slices = buckets.finish();
        assert_eq!(slices.len(), 4);
        assert_eq!(slices[0].timestamp, 0);
        assert_eq!(slices[0].avg, 2.0);
        assert!(slices[1].is_empty());
        assert_eq!(slices[2].avg, 5.0);
        assert_eq!(slices[3].max, 7.0);
    }

    #[test]
    fn rejects_bad_ranges() {
        assert!(TimeSliceBuckets::new(0, 100, 0).is_err());
        assert!(TimeSliceBuckets::new(100, 100, 2).is_err());
    }
}
