//! Named server operations

use crate::config::MigrationConfig;
use crate::migration::{drop_legacy_tables, AggregateMigrator, KeySource};
use crate::store::{ScheduleCatalog, StorageSession};
use crate::{Error, Result};
use futures::future::BoxFuture;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Operation arguments, as given in the job definition
pub type OperationArgs = Map<String, JsonValue>;

/// Typed handler of a named operation
pub type OperationHandler = fn(OperationContext, OperationArgs) -> BoxFuture<'static, Result<()>>;

pub const MIGRATE_AGGREGATE_METRICS: &str = "migrateAggregateMetrics";
pub const DROP_LEGACY_TABLES: &str = "dropLegacyTables";

/// Collaborators available to every operation
#[derive(Clone)]
pub struct OperationContext {
    pub session: Arc<dyn StorageSession>,
    pub catalog: Arc<dyn ScheduleCatalog>,
    pub config: MigrationConfig,
}

/// Maps operation names to handlers. Populated once at startup.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    handlers: BTreeMap<String, OperationHandler>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in storage operations
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MIGRATE_AGGREGATE_METRICS, migrate_aggregate_metrics);
        registry.register(DROP_LEGACY_TABLES, drop_tables);
        registry
    }

    /// Add or replace the handler for `name`
    pub fn register(&mut self, name: &str, handler: OperationHandler) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn resolve(&self, name: &str) -> Result<OperationHandler> {
        self.handlers
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownOperation(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

fn migrate_aggregate_metrics(
    ctx: OperationContext,
    args: OperationArgs,
) -> BoxFuture<'static, Result<()>> {
    Box::pin(run_migration(ctx, args))
}

fn drop_tables(ctx: OperationContext, args: OperationArgs) -> BoxFuture<'static, Result<()>> {
    Box::pin(run_drop_tables(ctx, args))
}

/// Runs the aggregate migration.
///
/// Arguments: `keySource` ("catalog" or "index", default "catalog"),
/// `dataDir` (overrides the configured log directory).
async fn run_migration(ctx: OperationContext, args: OperationArgs) -> Result<()> {
    let mut config = ctx.config;
    if let Some(dir) = string_arg(&args, "dataDir")? {
        config.data_dir = PathBuf::from(dir);
    }
    let key_source = match string_arg(&args, "keySource")?.as_deref() {
        None | Some("catalog") => KeySource::Catalog(ctx.catalog),
        Some("index") => KeySource::IndexScan,
        Some(other) => {
            return Err(Error::InvalidArgument(format!(
                "keySource must be 'catalog' or 'index', got '{}'",
                other
            )))
        }
    };
    let report = AggregateMigrator::new(ctx.session, key_source, config)?
        .run()
        .await?;
    info!(
        buckets = report.buckets.len(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Aggregate metrics migration operation finished"
    );
    Ok(())
}

/// Drops the legacy tables once every schedule in them is migrated.
///
/// Arguments: `dataDir` (overrides the configured log directory).
async fn run_drop_tables(ctx: OperationContext, args: OperationArgs) -> Result<()> {
    let data_dir = match string_arg(&args, "dataDir")? {
        Some(dir) => PathBuf::from(dir),
        None => ctx.config.data_dir.clone(),
    };
    let dropped =
        drop_legacy_tables(ctx.session, &data_dir, ctx.config.index_page_size).await?;
    info!(tables = ?dropped, "Dropped legacy tables");
    Ok(())
}

fn string_arg(args: &OperationArgs, key: &str) -> Result<Option<String>> {
    match args.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(Error::InvalidArgument(format!(
            "argument '{}' must be a string, got {}",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_registered() {
        let registry = OperationRegistry::with_defaults();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec![DROP_LEGACY_TABLES, MIGRATE_AGGREGATE_METRICS]
        );
        assert!(matches!(
            registry.resolve("reindex"),
            Err(Error::UnknownOperation(name)) if name == "reindex"
        ));
    }

    #[test]
    fn string_arguments_are_typed() {
        let mut args = OperationArgs::new();
        args.insert("keySource".to_string(), JsonValue::from(3));
        assert!(string_arg(&args, "keySource").is_err());
        assert_eq!(string_arg(&args, "dataDir").unwrap(), None);
    }
}
