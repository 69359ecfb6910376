//! Server-side maintenance operations
//!
//! Operations are looked up by name in an [`OperationRegistry`] built at
//! startup. A [`MaintenanceJob`] runs registered operations as ordered steps.

mod job;
mod registry;

pub use job::{FailureMode, MaintenanceJob, MaintenanceStep, StepOutcome};
pub use registry::{
    OperationArgs, OperationContext, OperationHandler, OperationRegistry, DROP_LEGACY_TABLES,
    MIGRATE_AGGREGATE_METRICS,
};
