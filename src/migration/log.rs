//! Per-bucket log of schedules whose migration is complete
//!
//! One append-only file per bucket, `<bucket>_migration.log`, holding
//! fixed-width records: the schedule id and a CRC32 of it, both little
//! endian. Every append is synced before it returns. A torn record left at
//! the end of the file by a crash is dropped and truncated away on open.

use crate::schema::{Bucket, ScheduleId};
use crate::{Error, Result};
use crc32fast::Hasher;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const RECORD_LEN: usize = 8;
const FILE_SUFFIX: &str = "_migration.log";

/// Path of the log file for a bucket inside `data_dir`
pub fn log_path(data_dir: &Path, bucket: Bucket) -> PathBuf {
    data_dir.join(format!("{}{}", bucket.as_str(), FILE_SUFFIX))
}

/// Append-only record of migrated schedule ids for one bucket
pub struct MigrationLog {
    bucket: Bucket,
    path: PathBuf,
    file: Mutex<Option<fs::File>>,
}

impl MigrationLog {
    /// Open or create the log for `bucket`, repairing a torn tail
    pub async fn open(data_dir: &Path, bucket: Bucket) -> Result<Self> {
        let path = log_path(data_dir, bucket);
        fs::create_dir_all(data_dir)
            .await
            .map_err(|e| log_error(&path, e))?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| log_error(&path, e))?;

        let bytes = fs::read(&path).await.map_err(|e| log_error(&path, e))?;
        let (ids, valid_len) = decode_records(&bytes);
        if valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                entries = ids.len(),
                discarded_bytes = bytes.len() - valid_len,
                "Torn migration log tail, truncating"
            );
            file.set_len(valid_len as u64)
                .await
                .map_err(|e| log_error(&path, e))?;
            file.sync_all().await.map_err(|e| log_error(&path, e))?;
        }

        Ok(Self {
            bucket,
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn bucket(&self) -> Bucket {
        self.bucket
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every schedule id recorded so far
    pub async fn read(&self) -> Result<HashSet<ScheduleId>> {
        let bytes = fs::read(&self.path)
            .await
            .map_err(|e| log_error(&self.path, e))?;
        let (ids, _) = decode_records(&bytes);
        debug!(bucket = %self.bucket, entries = ids.len(), "Read migration log");
        Ok(ids.into_iter().collect())
    }

    /// Append one id and sync it to disk before returning
    pub async fn write(&self, schedule_id: ScheduleId) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(|| Error::MigrationLog {
            path: self.path.clone(),
            message: "log is closed".to_string(),
        })?;
        file.write_all(&encode_record(schedule_id)).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Flush and release the file. Later writes fail.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            file.flush().await.map_err(|e| log_error(&self.path, e))?;
            file.sync_all().await.map_err(|e| log_error(&self.path, e))?;
        }
        Ok(())
    }
}

fn log_error(path: &Path, err: std::io::Error) -> Error {
    Error::MigrationLog {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn encode_record(schedule_id: ScheduleId) -> [u8; RECORD_LEN] {
    let id = schedule_id.to_le_bytes();
    let mut record = [0u8; RECORD_LEN];
    record[0..4].copy_from_slice(&id);
    record[4..8].copy_from_slice(&checksum(&id).to_le_bytes());
    record
}

/// Decode complete, intact records. Returns the ids and the length of the
/// valid prefix; decoding stops at the first short or corrupt record.
fn decode_records(bytes: &[u8]) -> (Vec<ScheduleId>, usize) {
    let mut ids = Vec::with_capacity(bytes.len() / RECORD_LEN);
    for record in bytes.chunks_exact(RECORD_LEN) {
        let (id, crc) = record.split_at(4);
        let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if checksum(id) != expected {
            break;
        }
        ids.push(ScheduleId::from_le_bytes([id[0], id[1], id[2], id[3]]));
    }
    let valid_len = ids.len() * RECORD_LEN;
    (ids, valid_len)
}
