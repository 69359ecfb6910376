//! Local in-memory store session for development and testing
//!
//! Holds the legacy bucket tables, the legacy index, the aggregate table and
//! raw data in ordered maps so reads come back sorted by clustering key, the
//! same way the real store returns them. Faults can be injected per schedule
//! (reads), per batch (writes) and for index scans. Every request it answers
//! counts as a heartbeat from the nodes that are up.

use super::{
    BoundStatement, PagingState, PreparedStatement, QueryTemplate, ResultSet, Row,
    StaticScheduleCatalog, StorageSession, Value,
};
use crate::cluster::NodeRegistry;
use crate::schema::{
    AggregateRecord, Bucket, RawSample, RawValue, ScheduleId, AGGREGATE_TABLE, INDEX_TABLE,
    KEYSPACE, RAW_TABLE,
};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_FETCH_SIZE: usize = 5000;

#[derive(Debug, Clone, Copy)]
struct LegacyCell {
    value: f64,
    ttl: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
struct AggregateCell {
    avg: f64,
    min: f64,
    max: f64,
    ttl: Option<u32>,
}

/// Clustering key of a legacy row: (schedule, timestamp, kind code)
type LegacyTable = BTreeMap<(ScheduleId, i64, i32), LegacyCell>;

/// Seed data for a local session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreFixture {
    /// Storage node addresses; one local node when empty
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Numeric measurement schedules known to the catalog
    #[serde(default)]
    pub schedules: Vec<ScheduleId>,
    #[serde(default)]
    pub legacy: Vec<LegacyRowFixture>,
    #[serde(default)]
    pub raw: Vec<RawValue>,
}

/// One legacy row together with the bucket table it lives in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyRowFixture {
    pub bucket: Bucket,
    #[serde(flatten)]
    pub sample: RawSample,
}

impl StoreFixture {
    /// Load a JSON fixture file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn catalog(&self) -> StaticScheduleCatalog {
        StaticScheduleCatalog::new(self.schedules.clone())
    }
}

/// Local in-memory store session
pub struct LocalStorageSession {
    tables: RwLock<BTreeSet<String>>,
    legacy: RwLock<HashMap<Bucket, LegacyTable>>,
    /// Legacy index entries per bucket: (time slice, schedule id)
    index: RwLock<HashMap<Bucket, BTreeSet<(i64, ScheduleId)>>>,
    aggregates: RwLock<BTreeMap<(ScheduleId, Bucket, i64), AggregateCell>>,
    raw: RwLock<BTreeMap<(ScheduleId, i64), f64>>,
    prepared: DashMap<Uuid, QueryTemplate>,
    node_registry: Arc<NodeRegistry>,
    latency: Option<Duration>,
    read_faults: DashMap<ScheduleId, u32>,
    write_faults: AtomicU32,
    scan_fault: AtomicBool,
    legacy_reads: DashMap<(Bucket, ScheduleId), u32>,
    write_batches: AtomicU64,
}

impl LocalStorageSession {
    /// Create an empty session backed by a single storage node
    pub fn new() -> Self {
        let tables = Bucket::ALL
            .iter()
            .map(|b| b.legacy_table())
            .chain([AGGREGATE_TABLE, RAW_TABLE, INDEX_TABLE])
            .map(str::to_string)
            .collect();
        Self {
            tables: RwLock::new(tables),
            legacy: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            aggregates: RwLock::new(BTreeMap::new()),
            raw: RwLock::new(BTreeMap::new()),
            prepared: DashMap::new(),
            node_registry: Arc::new(NodeRegistry::with_nodes(30, ["127.0.0.1"])),
            latency: None,
            read_faults: DashMap::new(),
            write_faults: AtomicU32::new(0),
            scan_fault: AtomicBool::new(false),
            legacy_reads: DashMap::new(),
            write_batches: AtomicU64::new(0),
        }
    }

    /// Build a session seeded from a fixture
    pub fn from_fixture(fixture: &StoreFixture) -> Self {
        let mut session = Self::new();
        if !fixture.nodes.is_empty() {
            session.node_registry =
                Arc::new(NodeRegistry::with_nodes(30, fixture.nodes.iter().cloned()));
        }
        for row in &fixture.legacy {
            session.insert_legacy(row.bucket, row.sample);
        }
        for value in &fixture.raw {
            session.insert_raw(*value);
        }
        session
    }

    /// Delay every statement by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_node_registry(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.node_registry = registry;
        self
    }

    /// Insert a legacy row and index its schedule for the row's time slice
    pub fn insert_legacy(&self, bucket: Bucket, sample: RawSample) {
        self.legacy.write().entry(bucket).or_default().insert(
            (sample.schedule_id, sample.timestamp, sample.kind.code()),
            LegacyCell {
                value: sample.value,
                ttl: sample.ttl,
            },
        );
        self.index
            .write()
            .entry(bucket)
            .or_default()
            .insert((bucket.slice_start(sample.timestamp), sample.schedule_id));
    }

    pub fn insert_raw(&self, value: RawValue) {
        self.raw
            .write()
            .insert((value.schedule_id, value.timestamp), value.value);
    }

    pub fn insert_aggregate(&self, record: AggregateRecord) {
        self.aggregates.write().insert(
            (record.schedule_id, record.bucket, record.timestamp),
            AggregateCell {
                avg: record.avg,
                min: record.min,
                max: record.max,
                ttl: record.ttl,
            },
        );
    }

    /// Aggregates stored for one bucket, ordered by (schedule, timestamp)
    pub fn aggregates(&self, bucket: Bucket) -> Vec<AggregateRecord> {
        self.all_aggregates()
            .into_iter()
            .filter(|r| r.bucket == bucket)
            .collect()
    }

    pub fn all_aggregates(&self) -> Vec<AggregateRecord> {
        self.aggregates
            .read()
            .iter()
            .map(|(&(schedule_id, bucket, timestamp), cell)| AggregateRecord {
                schedule_id,
                bucket,
                timestamp,
                avg: cell.avg,
                min: cell.min,
                max: cell.max,
                ttl: cell.ttl,
            })
            .collect()
    }

    /// How many times the legacy rows of a schedule were read
    pub fn legacy_reads(&self, bucket: Bucket, schedule_id: ScheduleId) -> u32 {
        self.legacy_reads
            .get(&(bucket, schedule_id))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Number of write batches applied
    pub fn write_batches(&self) -> u64 {
        self.write_batches.load(Ordering::Relaxed)
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.read().contains(table)
    }

    /// Fail the next `times` legacy reads of a schedule
    pub fn fail_reads(&self, schedule_id: ScheduleId, times: u32) {
        self.read_faults.insert(schedule_id, times);
    }

    /// Fail the next `times` write statements or batches
    pub fn fail_write_batches(&self, times: u32) {
        self.write_faults.store(times, Ordering::SeqCst);
    }

    /// Make every index scan fail until cleared
    pub fn fail_index_scan(&self, fail: bool) {
        self.scan_fault.store(fail, Ordering::SeqCst);
    }

    fn require_table(&self, table: &str) -> Result<()> {
        if self.tables.read().contains(table) {
            Ok(())
        } else {
            Err(Error::TableNotFound(format!("{}.{}", KEYSPACE, table)))
        }
    }

    fn take_read_fault(&self, schedule_id: ScheduleId) -> bool {
        match self.read_faults.get_mut(&schedule_id) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn take_write_fault(&self) -> bool {
        self.write_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn find_legacy_rows(&self, bucket: Bucket, statement: &BoundStatement) -> Result<ResultSet> {
        self.require_table(bucket.legacy_table())?;
        let schedule_id = Row::new(statement.values().to_vec()).get_int(0)?;
        // Faults and read counts apply to the first page of a read
        if statement.paging_state().is_none() {
            if self.take_read_fault(schedule_id) {
                return Err(Error::Storage(format!(
                    "read timeout for schedule {} in {}",
                    schedule_id,
                    bucket.legacy_table()
                )));
            }
            *self.legacy_reads.entry((bucket, schedule_id)).or_insert(0) += 1;
        }

        let legacy = self.legacy.read();
        let rows: Vec<Row> = legacy
            .get(&bucket)
            .map(|table| {
                table
                    .range((schedule_id, i64::MIN, i32::MIN)..=(schedule_id, i64::MAX, i32::MAX))
                    .map(|(&(_, timestamp, code), cell)| {
                        Row::new(vec![
                            Value::Timestamp(timestamp),
                            Value::Int(code),
                            Value::Double(cell.value),
                            Value::from(cell.ttl),
                        ])
                    })
                    .collect()
            })
            .unwrap_or_default();
        page(rows, statement)
    }

    fn scan_index(&self, bucket: Bucket, statement: &BoundStatement) -> Result<ResultSet> {
        self.require_table(INDEX_TABLE)?;
        if self.scan_fault.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!(
                "index scan of {} timed out",
                bucket
            )));
        }
        let index = self.index.read();
        let rows: Vec<Row> = index
            .get(&bucket)
            .into_iter()
            .flatten()
            .map(|&(_, schedule_id)| Row::new(vec![Value::Int(schedule_id)]))
            .collect();
        page(rows, statement)
    }

    fn apply_insert(&self, statement: &BoundStatement) -> Result<()> {
        self.require_table(AGGREGATE_TABLE)?;
        let params = Row::new(statement.values().to_vec());
        let bucket: Bucket = params
            .get_text(1)?
            .parse()
            .map_err(Error::InvalidStatement)?;
        let ttl = params
            .get_opt_int(6)?
            .map(|t| u32::try_from(t).map_err(|_| Error::InvalidStatement(format!("negative ttl {}", t))))
            .transpose()?;
        let record = AggregateRecord {
            schedule_id: params.get_int(0)?,
            bucket,
            timestamp: params.get_timestamp(2)?,
            avg: params.get_double(3)?,
            max: params.get_double(4)?,
            min: params.get_double(5)?,
            ttl,
        };
        self.insert_aggregate(record);
        Ok(())
    }

    fn find_aggregate_range(&self, bucket: Bucket, params: &Row) -> Result<ResultSet> {
        self.require_table(AGGREGATE_TABLE)?;
        let schedule_id = params.get_int(0)?;
        let (start, end) = (params.get_timestamp(1)?, params.get_timestamp(2)?);
        if start >= end {
            return Ok(ResultSet::empty());
        }
        let rows = self
            .aggregates
            .read()
            .range((schedule_id, bucket, start)..(schedule_id, bucket, end))
            .map(|(&(_, _, timestamp), cell)| {
                Row::new(vec![
                    Value::Timestamp(timestamp),
                    Value::Double(cell.avg),
                    Value::Double(cell.max),
                    Value::Double(cell.min),
                ])
            })
            .collect();
        Ok(ResultSet::new(rows))
    }

    fn find_raw_range(&self, params: &Row) -> Result<ResultSet> {
        self.require_table(RAW_TABLE)?;
        let schedule_id = params.get_int(0)?;
        let (start, end) = (params.get_timestamp(1)?, params.get_timestamp(2)?);
        if start >= end {
            return Ok(ResultSet::empty());
        }
        let rows = self
            .raw
            .read()
            .range((schedule_id, start)..(schedule_id, end))
            .map(|(&(_, timestamp), value)| {
                Row::new(vec![Value::Timestamp(timestamp), Value::Double(*value)])
            })
            .collect();
        Ok(ResultSet::new(rows))
    }

    fn check_prepared(&self, statement: &BoundStatement) -> Result<()> {
        match self.prepared.get(&statement.prepared_id()) {
            Some(template) if *template == statement.template() => Ok(()),
            _ => Err(Error::InvalidStatement(format!(
                "statement {} was not prepared by this session",
                statement.prepared_id()
            ))),
        }
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for LocalStorageSession {
    fn default() -> Self {
        Self::new()
    }
}

/// The page of `rows` selected by the statement's paging state and fetch size
fn page(rows: Vec<Row>, statement: &BoundStatement) -> Result<ResultSet> {
    let offset = match statement.paging_state() {
        Some(state) => decode_offset(state)?,
        None => 0,
    };
    let page_size = statement.fetch_size().unwrap_or(DEFAULT_FETCH_SIZE).max(1);
    let total = rows.len();
    let rows: Vec<Row> = rows.into_iter().skip(offset).take(page_size).collect();
    let next = offset + rows.len();
    Ok(ResultSet {
        rows,
        paging_state: (next < total).then(|| PagingState::new((next as u64).to_le_bytes().to_vec())),
    })
}

fn decode_offset(state: &PagingState) -> Result<usize> {
    let bytes: [u8; 8] = state
        .as_bytes()
        .try_into()
        .map_err(|_| Error::InvalidStatement("malformed paging state".to_string()))?;
    Ok(u64::from_le_bytes(bytes) as usize)
}

#[async_trait]
impl StorageSession for LocalStorageSession {
    async fn prepare(&self, template: QueryTemplate) -> Result<PreparedStatement> {
        let prepared = PreparedStatement::new(template);
        self.prepared.insert(prepared.id(), template);
        Ok(prepared)
    }

    async fn execute(&self, statement: BoundStatement) -> Result<ResultSet> {
        self.simulate_latency().await;
        self.node_registry.refresh_up_nodes().await;
        self.check_prepared(&statement)?;
        let params = Row::new(statement.values().to_vec());
        match statement.template() {
            QueryTemplate::FindLegacyRows(bucket) => self.find_legacy_rows(bucket, &statement),
            QueryTemplate::ScanLegacyIndex(bucket) => self.scan_index(bucket, &statement),
            QueryTemplate::InsertAggregate => {
                if self.take_write_fault() {
                    return Err(Error::Storage("write timeout".to_string()));
                }
                self.apply_insert(&statement)?;
                Ok(ResultSet::empty())
            }
            QueryTemplate::FindAggregateRange(bucket) => self.find_aggregate_range(bucket, &params),
            QueryTemplate::FindRawRange => self.find_raw_range(&params),
        }
    }

    async fn execute_batch(&self, statements: Vec<BoundStatement>) -> Result<()> {
        self.simulate_latency().await;
        self.node_registry.refresh_up_nodes().await;
        for statement in &statements {
            self.check_prepared(statement)?;
            if !statement.template().is_write() {
                return Err(Error::InvalidStatement(format!(
                    "{:?} cannot be batched",
                    statement.template()
                )));
            }
        }
        if self.take_write_fault() {
            return Err(Error::Storage(format!(
                "batch of {} statements timed out",
                statements.len()
            )));
        }
        for statement in &statements {
            self.apply_insert(statement)?;
        }
        self.write_batches.fetch_add(1, Ordering::Relaxed);
        debug!(statements = statements.len(), "Applied write batch");
        Ok(())
    }

    async fn list_tables(&self, keyspace: &str) -> Result<Vec<String>> {
        if keyspace != KEYSPACE {
            return Ok(Vec::new());
        }
        Ok(self.tables.read().iter().cloned().collect())
    }

    async fn drop_table(&self, keyspace: &str, table: &str) -> Result<()> {
        if keyspace != KEYSPACE || !self.tables.write().remove(table) {
            return Err(Error::TableNotFound(format!("{}.{}", keyspace, table)));
        }
        if let Some(bucket) = Bucket::ALL.iter().find(|b| b.legacy_table() == table) {
            self.legacy.write().remove(bucket);
            self.index.write().remove(bucket);
        }
        Ok(())
    }

    fn node_registry(&self) -> Arc<NodeRegistry> {
        self.node_registry.clone()
    }
}
