//! Range reads against the raw and aggregate tables
//!
//! Raw data is kept for seven days, then each coarser bucket takes over until
//! its own retention runs out. Reads page through the store and fold rows into
//! [`AggregateComposite`]s, using the mean of averages for aggregate rows and
//! the true mean for raw values.

use crate::aggregation::{AggregateComposite, SummaryAccumulator, TimeSliceBuckets};
use crate::clock::Clock;
use crate::schema::{Bucket, ScheduleId, RAW_RETENTION_DAYS};
use crate::store::{PreparedStatement, QueryTemplate, ResultSet, StorageSession, Value};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const PAGE_SIZE: usize = 5000;

/// Table a query reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSource {
    Raw,
    Aggregate(Bucket),
}

/// Finest source whose retention still covers `begin` at time `now`
pub fn select_source(begin: i64, now: i64) -> Result<DataSource> {
    let age = now.saturating_sub(begin).max(0);
    let raw_retention = Duration::from_secs(RAW_RETENTION_DAYS * 24 * 3600);
    if age < raw_retention.as_millis() as i64 {
        return Ok(DataSource::Raw);
    }
    Bucket::ALL
        .iter()
        .find(|b| age < b.retention().as_millis() as i64)
        .map(|&b| DataSource::Aggregate(b))
        .ok_or_else(|| {
            Error::OutOfRange(format!(
                "begin time {} is older than the longest retention period",
                begin
            ))
        })
}

/// Reads raw and aggregate data for display
pub struct MetricsReader {
    session: Arc<dyn StorageSession>,
    clock: Arc<dyn Clock>,
    raw_range: PreparedStatement,
    aggregate_range: HashMap<Bucket, PreparedStatement>,
}

impl MetricsReader {
    /// Prepare the range statements on `session`
    pub async fn new(session: Arc<dyn StorageSession>, clock: Arc<dyn Clock>) -> Result<Self> {
        let raw_range = session.prepare(QueryTemplate::FindRawRange).await?;
        let mut aggregate_range = HashMap::new();
        for bucket in Bucket::ALL {
            let prepared = session
                .prepare(QueryTemplate::FindAggregateRange(bucket))
                .await?;
            aggregate_range.insert(bucket, prepared);
        }
        Ok(Self {
            session,
            clock,
            raw_range,
            aggregate_range,
        })
    }

    /// `data_points` equal slices of `[begin, end)` for one schedule. Slices
    /// without data have NaN fields.
    pub async fn find_data_for_resource(
        &self,
        schedule_id: ScheduleId,
        begin: i64,
        end: i64,
        data_points: usize,
    ) -> Result<Vec<AggregateComposite>> {
        let mut slices = TimeSliceBuckets::new(begin, end, data_points)?;
        let source = select_source(begin, self.clock.now_millis())?;
        debug!(schedule_id, ?source, begin, end, data_points, "Reading data for resource");

        let pages = self.read_range(source, schedule_id, begin, end).await?;
        for row in pages.iter().flat_map(|page| page.rows.iter()) {
            let timestamp = row.get_timestamp(0)?;
            match source {
                DataSource::Raw => slices.insert_value(timestamp, row.get_double(1)?),
                DataSource::Aggregate(_) => {
                    let (avg, max, min) = (row.get_double(1)?, row.get_double(2)?, row.get_double(3)?);
                    slices.insert_aggregate(timestamp, avg, min, max);
                }
            }
        }
        Ok(slices.finish())
    }

    /// One summary across every schedule in `schedule_ids` over `[begin, end)`.
    ///
    /// Aggregated data is summarized as a mean of means; raw data as the mean
    /// of its values.
    pub async fn summary_aggregate(
        &self,
        schedule_ids: &[ScheduleId],
        begin: i64,
        end: i64,
    ) -> Result<AggregateComposite> {
        if end <= begin {
            return Err(Error::InvalidArgument(format!(
                "end time {} is not after begin time {}",
                end, begin
            )));
        }
        let source = select_source(begin, self.clock.now_millis())?;
        let mut summary = SummaryAccumulator::default();
        for &schedule_id in schedule_ids {
            let pages = self.read_range(source, schedule_id, begin, end).await?;
            for row in pages.iter().flat_map(|page| page.rows.iter()) {
                match source {
                    DataSource::Raw => summary.add_value(row.get_double(1)?),
                    DataSource::Aggregate(_) => summary.add_aggregate(
                        row.get_double(1)?,
                        row.get_double(3)?,
                        row.get_double(2)?,
                    ),
                }
            }
        }
        Ok(summary.finish(begin))
    }

    async fn read_range(
        &self,
        source: DataSource,
        schedule_id: ScheduleId,
        begin: i64,
        end: i64,
    ) -> Result<Vec<ResultSet>> {
        let prepared = match source {
            DataSource::Raw => &self.raw_range,
            DataSource::Aggregate(bucket) => self
                .aggregate_range
                .get(&bucket)
                .ok_or_else(|| Error::Internal(format!("no range read prepared for {}", bucket)))?,
        };

        let mut pages = Vec::new();
        let mut paging_state = None;
        loop {
            let statement = prepared
                .bind(vec![
                    Value::Int(schedule_id),
                    Value::Timestamp(begin),
                    Value::Timestamp(end),
                ])?
                .with_fetch_size(PAGE_SIZE)
                .with_paging_state(paging_state.take());
            let page = self.session.execute(statement).await?;
            let next = page.paging_state.clone();
            pages.push(page);
            match next {
                Some(state) => paging_state = Some(state),
                None => break,
            }
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 24 * 3600 * 1000;

    #[test]
    fn source_follows_data_age() {
        let now = 1_000 * DAY;
        assert_eq!(select_source(now - DAY, now).unwrap(), DataSource::Raw);
        assert_eq!(select_source(now + DAY, now).unwrap(), DataSource::Raw);
        assert_eq!(
            select_source(now - 7 * DAY, now).unwrap(),
            DataSource::Aggregate(Bucket::OneHour)
        );
        assert_eq!(
            select_source(now - 20 * DAY, now).unwrap(),
            DataSource::Aggregate(Bucket::SixHour)
        );
        assert_eq!(
            select_source(now - 364 * DAY, now).unwrap(),
            DataSource::Aggregate(Bucket::TwentyFourHour)
        );
        assert!(matches!(
            select_source(now - 365 * DAY, now),
            Err(Error::OutOfRange(_))
        ));
    }
}
