//! Migration configuration and component factory
//!
//! Settings come from defaults overridden by environment variables; the
//! binary applies command-line flags on top.

use crate::rate_limit::RateMonitorConfig;
use crate::schema::Bucket;
use crate::store::{LocalStorageSession, ScheduleCatalog, StoreFixture};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Settings of one migration run
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Directory holding the per-bucket migration logs
    pub data_dir: PathBuf,
    /// Baseline reads per second for a single-node cluster
    pub read_limit: f64,
    /// Baseline writes per second for a single-node cluster
    pub write_limit: f64,
    /// Fraction of the baseline added for each additional node
    pub increase_per_node: f64,
    /// Ramp time for any rate change
    pub warmup: Duration,
    /// Schedules read per batch
    pub batch_size: usize,
    /// Statements per write batch
    pub write_group_size: usize,
    pub progress_interval: Duration,
    /// Pause before retrying failed writes, or after a batch whose reads all failed
    pub retry_backoff: Duration,
    /// Wall-clock bound of a run; unbounded when `None`
    pub max_run_duration: Option<Duration>,
    /// Migrate buckets concurrently instead of one after another
    pub concurrent_buckets: bool,
    /// Drop the legacy tables once every bucket is done
    pub drop_legacy_tables: bool,
    /// Rows per page when scanning the legacy index
    pub index_page_size: usize,
    /// Rows per page when reading the legacy rows of one schedule
    pub read_page_size: usize,
    /// Buckets to migrate, in order
    pub buckets: Vec<Bucket>,
    pub monitor: RateMonitorConfig,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/rollup-migrator"),
            read_limit: 200.0,
            write_limit: 2000.0,
            increase_per_node: 0.35,
            warmup: Duration::from_secs(30),
            batch_size: 500,
            write_group_size: 45,
            progress_interval: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(100),
            max_run_duration: None,
            concurrent_buckets: false,
            drop_legacy_tables: true,
            index_page_size: 1000,
            read_page_size: 5000,
            buckets: Bucket::ALL.to_vec(),
            monitor: RateMonitorConfig::default(),
        }
    }
}

impl MigrationConfig {
    /// Defaults overridden by environment variables
    ///
    /// - MIGRATION_DATA_DIR
    /// - STORAGE_READ_REQUEST_LIMIT, STORAGE_WRITE_REQUEST_LIMIT
    /// - STORAGE_REQUEST_INCREASE_PER_NODE
    /// - STORAGE_REQUEST_WARMUP_SECS
    /// - MIGRATION_BATCH_SIZE, MIGRATION_WRITE_GROUP_SIZE
    /// - MIGRATION_PROGRESS_INTERVAL_SECS, MIGRATION_MAX_RUN_SECS
    /// - MIGRATION_CONCURRENT_BUCKETS, MIGRATION_DROP_LEGACY_TABLES
    /// - MIGRATION_INDEX_PAGE_SIZE, MIGRATION_READ_PAGE_SIZE
    /// - MIGRATION_BUCKETS (comma separated, e.g. `one_hour,six_hour`)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("MIGRATION_DATA_DIR") {
            config.data_dir = PathBuf::from(dir.trim());
        }
        if let Some(v) = parse_env("STORAGE_READ_REQUEST_LIMIT")? {
            config.read_limit = v;
        }
        if let Some(v) = parse_env("STORAGE_WRITE_REQUEST_LIMIT")? {
            config.write_limit = v;
        }
        if let Some(v) = parse_env("STORAGE_REQUEST_INCREASE_PER_NODE")? {
            config.increase_per_node = v;
        }
        if let Some(secs) = parse_env("STORAGE_REQUEST_WARMUP_SECS")? {
            config.warmup = Duration::from_secs(secs);
        }
        if let Some(v) = parse_env("MIGRATION_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = parse_env("MIGRATION_WRITE_GROUP_SIZE")? {
            config.write_group_size = v;
        }
        if let Some(secs) = parse_env("MIGRATION_PROGRESS_INTERVAL_SECS")? {
            config.progress_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("MIGRATION_MAX_RUN_SECS")? {
            config.max_run_duration = Some(Duration::from_secs(secs));
        }
        if let Some(v) = parse_optional_bool("MIGRATION_CONCURRENT_BUCKETS")? {
            config.concurrent_buckets = v;
        }
        if let Some(v) = parse_optional_bool("MIGRATION_DROP_LEGACY_TABLES")? {
            config.drop_legacy_tables = v;
        }
        if let Some(v) = parse_env("MIGRATION_INDEX_PAGE_SIZE")? {
            config.index_page_size = v;
        }
        if let Some(v) = parse_env("MIGRATION_READ_PAGE_SIZE")? {
            config.read_page_size = v;
        }
        if let Ok(raw) = std::env::var("MIGRATION_BUCKETS") {
            config.buckets = parse_buckets(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the migration cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(self.read_limit > 0.0) || !(self.write_limit > 0.0) {
            return Err(Error::Config(format!(
                "request limits must be positive (read={}, write={})",
                self.read_limit, self.write_limit
            )));
        }
        if !(self.increase_per_node >= 0.0) {
            return Err(Error::Config(format!(
                "increase per node must not be negative, got {}",
                self.increase_per_node
            )));
        }
        if self.batch_size == 0
            || self.write_group_size == 0
            || self.index_page_size == 0
            || self.read_page_size == 0
        {
            return Err(Error::Config(
                "batch, write group and page sizes must be positive".to_string(),
            ));
        }
        if self.progress_interval.is_zero() || self.monitor.window.is_zero() {
            return Err(Error::Config(
                "progress interval and monitor window must be positive".to_string(),
            ));
        }
        if self.buckets.is_empty() {
            return Err(Error::Config("no buckets selected".to_string()));
        }
        // Each bucket owns one migration log
        for (i, bucket) in self.buckets.iter().enumerate() {
            if self.buckets[..i].contains(bucket) {
                return Err(Error::Config(format!("bucket {} selected more than once", bucket)));
            }
        }
        let m = &self.monitor;
        if !(0.0..=1.0).contains(&m.failure_threshold)
            || !(m.decrease_factor > 0.0 && m.decrease_factor < 1.0)
            || !(m.min_scale > 0.0 && m.min_scale <= 1.0)
        {
            return Err(Error::Config(format!("invalid rate monitor settings: {:?}", m)));
        }
        Ok(())
    }
}

/// Parse a comma separated bucket list
pub fn parse_buckets(raw: &str) -> Result<Vec<Bucket>> {
    let mut buckets = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let bucket: Bucket = part.parse().map_err(Error::Config)?;
        if !buckets.contains(&bucket) {
            buckets.push(bucket);
        }
    }
    Ok(buckets)
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{name} has invalid value '{raw}': {e}")))
}

fn parse_optional_bool(name: &str) -> Result<Option<bool>> {
    let Some(raw) = std::env::var(name).ok() else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::Config(format!(
            "{name} must be a boolean (true/false/1/0), got '{raw}'"
        ))),
    }
}

/// Store components used by a run
pub struct Components {
    pub session: Arc<LocalStorageSession>,
    pub catalog: Arc<dyn ScheduleCatalog>,
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Local in-memory store, optionally seeded from a fixture file
    pub fn create_local(fixture: Option<&Path>) -> Result<Components> {
        let fixture = match fixture {
            Some(path) => {
                info!(path = %path.display(), "Loading store fixture");
                StoreFixture::load(path)?
            }
            None => {
                info!("Using empty local store (development mode)");
                StoreFixture::default()
            }
        };
        Ok(Components {
            session: Arc::new(LocalStorageSession::from_fixture(&fixture)),
            catalog: Arc::new(fixture.catalog()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        MigrationConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_batch_size_rejected() {
        let config = MigrationConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn negative_increase_rejected() {
        let config = MigrationConfig {
            increase_per_node: -0.1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_buckets_rejected() {
        let config = MigrationConfig {
            buckets: vec![Bucket::OneHour, Bucket::SixHour, Bucket::OneHour],
            concurrent_buckets: true,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("one_hour")));
    }

    #[test]
    fn zero_read_page_size_rejected() {
        let config = MigrationConfig {
            read_page_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bucket_list_parsing() {
        assert_eq!(
            parse_buckets("six_hour, one_hour,six_hour").unwrap(),
            vec![Bucket::SixHour, Bucket::OneHour]
        );
        assert!(parse_buckets("hourly").is_err());
    }

    #[test]
    fn local_components_from_fixture() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fixture.json");
        std::fs::write(&path, r#"{"schedules": [1, 2, 3]}"#).unwrap();

        let components = ComponentFactory::create_local(Some(&path)).unwrap();
        let ids = futures::executor::block_on(components.catalog.list_numeric_schedule_ids())
            .unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
