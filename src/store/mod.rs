//! Store collaborators
//!
//! The column-family store is reached through [`StorageSession`], an async
//! statement-execution interface. Candidate keys for the first migration
//! generation come from the relational catalog behind [`ScheduleCatalog`].

mod local;
mod statement;

pub use local::{LegacyRowFixture, LocalStorageSession, StoreFixture};
pub use statement::{
    BoundStatement, PagingState, PreparedStatement, QueryTemplate, ResultSet, Row, Value,
};

use crate::cluster::NodeRegistry;
use crate::schema::ScheduleId;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Store session interface
///
/// Abstracts the column-family store so the migration can run against a
/// real cluster driver or the in-memory session used in tests.
#[async_trait]
pub trait StorageSession: Send + Sync {
    /// Prepare a statement for repeated execution
    async fn prepare(&self, template: QueryTemplate) -> Result<PreparedStatement>;

    /// Execute one statement, returning at most one page of rows
    async fn execute(&self, statement: BoundStatement) -> Result<ResultSet>;

    /// Execute write statements as one atomic unit
    async fn execute_batch(&self, statements: Vec<BoundStatement>) -> Result<()>;

    /// Names of the tables in a keyspace
    async fn list_tables(&self, keyspace: &str) -> Result<Vec<String>>;

    /// Drop a table
    async fn drop_table(&self, keyspace: &str, table: &str) -> Result<()>;

    /// Topology of the cluster behind this session
    fn node_registry(&self) -> Arc<NodeRegistry>;
}

/// Key-listing interface to the relational metadata store
#[async_trait]
pub trait ScheduleCatalog: Send + Sync {
    /// Ids of all schedules whose data type is a numeric measurement
    async fn list_numeric_schedule_ids(&self) -> Result<Vec<ScheduleId>>;
}

/// Catalog over a fixed list of schedule ids
#[derive(Debug, Clone, Default)]
pub struct StaticScheduleCatalog {
    ids: Vec<ScheduleId>,
}

impl StaticScheduleCatalog {
    pub fn new(ids: Vec<ScheduleId>) -> Self {
        Self { ids }
    }
}

#[async_trait]
impl ScheduleCatalog for StaticScheduleCatalog {
    async fn list_numeric_schedule_ids(&self) -> Result<Vec<ScheduleId>> {
        Ok(self.ids.clone())
    }
}
