//! Enumerates schedules with data in a legacy bucket

use crate::schema::{Bucket, ScheduleId};
use crate::store::{QueryTemplate, StorageSession};
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Pages through the legacy index of a bucket and collects distinct schedule ids
pub struct KeyScanner {
    session: Arc<dyn StorageSession>,
    page_size: usize,
}

impl KeyScanner {
    pub fn new(session: Arc<dyn StorageSession>, page_size: usize) -> Self {
        Self {
            session,
            page_size: page_size.max(1),
        }
    }

    /// All schedule ids with data in `bucket`.
    ///
    /// Any failure fails the whole scan; a partial key set is never returned.
    pub async fn scan_keys(&self, bucket: Bucket) -> Result<BTreeSet<ScheduleId>> {
        let scan_error = |e: Error| Error::Scan {
            bucket,
            message: e.to_string(),
        };

        let prepared = self
            .session
            .prepare(QueryTemplate::ScanLegacyIndex(bucket))
            .await
            .map_err(scan_error)?;

        let mut keys = BTreeSet::new();
        let mut paging_state = None;
        let mut pages = 0usize;
        loop {
            let statement = prepared
                .bind(Vec::new())
                .map_err(scan_error)?
                .with_fetch_size(self.page_size)
                .with_paging_state(paging_state.take());
            let page = self.session.execute(statement).await.map_err(scan_error)?;
            pages += 1;
            for row in &page.rows {
                keys.insert(row.get_int(0).map_err(scan_error)?);
            }
            match page.paging_state {
                Some(next) => paging_state = Some(next),
                None => break,
            }
        }

        info!(bucket = %bucket, schedules = keys.len(), pages, "Scanned legacy index");
        Ok(keys)
    }
}
