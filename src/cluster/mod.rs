//! Storage cluster topology
//!
//! Only the number of live storage nodes matters to the migration: request
//! limits are scaled by it.

pub mod node_registry;

pub use node_registry::{NodeRegistry, NodeStatus, StorageNode};
