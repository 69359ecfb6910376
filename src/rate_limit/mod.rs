//! Admission control for store requests
//!
//! Reads and writes each go through their own [`RateLimiter`]. Targets are
//! derived from the number of storage nodes that are up and adjusted by the
//! [`RateMonitor`] from observed request outcomes.

mod limiter;
mod monitor;

pub use limiter::RateLimiter;
pub use monitor::{RateMonitor, RateMonitorConfig};

/// Cluster-wide request rate for `up_nodes` nodes
///
/// `base + base * increase_per_node * (up_nodes - 1)`. A cluster with no
/// live nodes is treated as a single node.
pub fn calculate_rate(base: f64, increase_per_node: f64, up_nodes: usize) -> f64 {
    let extra_nodes = up_nodes.max(1) - 1;
    base + base * increase_per_node * extra_nodes as f64
}
