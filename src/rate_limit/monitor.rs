//! Feedback loop over the read and write limiters
//!
//! Request outcomes are counted per evaluation window. When the failure ratio
//! of a window exceeds the threshold the rate scale is cut; healthy windows
//! restore it step by step. Topology changes recompute the base rates.

use super::{calculate_rate, RateLimiter};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Rate monitor configuration
#[derive(Debug, Clone)]
pub struct RateMonitorConfig {
    /// Length of one evaluation window
    pub window: Duration,
    /// Failure ratio above which rates are cut
    pub failure_threshold: f64,
    /// Multiplier applied to the scale on a bad window
    pub decrease_factor: f64,
    /// Amount added back to the scale on a healthy window
    pub increase_step: f64,
    /// Lowest scale the monitor will go to
    pub min_scale: f64,
    /// Windows with fewer requests than this are not judged
    pub min_requests: u64,
}

impl Default for RateMonitorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            failure_threshold: 0.05,
            decrease_factor: 0.8,
            increase_step: 0.1,
            min_scale: 0.1,
            min_requests: 10,
        }
    }
}

#[derive(Debug)]
struct Targets {
    read_base: f64,
    write_base: f64,
    increase_per_node: f64,
    up_nodes: usize,
    scale: f64,
}

/// Observes request outcomes and adjusts both limiters
pub struct RateMonitor {
    read_limiter: Arc<RateLimiter>,
    write_limiter: Arc<RateLimiter>,
    targets: Mutex<Targets>,
    succeeded: AtomicU64,
    failed: AtomicU64,
    config: RateMonitorConfig,
}

impl RateMonitor {
    /// Build the read and write limiters for `up_nodes` nodes and a monitor over them
    pub fn new(
        read_base: f64,
        write_base: f64,
        increase_per_node: f64,
        up_nodes: usize,
        warmup: Duration,
        config: RateMonitorConfig,
    ) -> Self {
        let read_limiter = Arc::new(RateLimiter::new(
            "read",
            calculate_rate(read_base, increase_per_node, up_nodes),
            warmup,
        ));
        let write_limiter = Arc::new(RateLimiter::new(
            "write",
            calculate_rate(write_base, increase_per_node, up_nodes),
            warmup,
        ));
        info!(
            up_nodes,
            read_rate = read_limiter.rate(),
            write_rate = write_limiter.rate(),
            "Request limits initialized"
        );
        Self {
            read_limiter,
            write_limiter,
            targets: Mutex::new(Targets {
                read_base,
                write_base,
                increase_per_node,
                up_nodes,
                scale: 1.0,
            }),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            config,
        }
    }

    pub fn read_limiter(&self) -> Arc<RateLimiter> {
        self.read_limiter.clone()
    }

    pub fn write_limiter(&self) -> Arc<RateLimiter> {
        self.write_limiter.clone()
    }

    pub fn request_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Current multiplier applied to the topology-derived rates
    pub fn scale(&self) -> f64 {
        self.targets.lock().scale
    }

    /// Recompute both targets for a new up-node count
    pub fn topology_changed(&self, up_nodes: usize) {
        let mut targets = self.targets.lock();
        if targets.up_nodes == up_nodes {
            return;
        }
        info!(from = targets.up_nodes, to = up_nodes, "Storage topology changed");
        targets.up_nodes = up_nodes;
        self.apply(&targets);
    }

    /// Judge the outcomes of the window that just ended and adjust the scale
    pub fn evaluate(&self) -> f64 {
        let succeeded = self.succeeded.swap(0, Ordering::Relaxed);
        let failed = self.failed.swap(0, Ordering::Relaxed);
        let total = succeeded + failed;

        let mut targets = self.targets.lock();
        if total < self.config.min_requests {
            return targets.scale;
        }

        let ratio = failed as f64 / total as f64;
        let previous = targets.scale;
        if ratio > self.config.failure_threshold {
            targets.scale = (previous * self.config.decrease_factor).max(self.config.min_scale);
            warn!(
                failed,
                total,
                ratio,
                scale = targets.scale,
                "Request failure ratio too high, lowering request rates"
            );
        } else if previous < 1.0 {
            targets.scale = (previous + self.config.increase_step).min(1.0);
            info!(scale = targets.scale, "Request failures subsided, raising request rates");
        }
        if targets.scale != previous {
            self.apply(&targets);
        }
        targets.scale
    }

    fn apply(&self, targets: &Targets) {
        let read = calculate_rate(targets.read_base, targets.increase_per_node, targets.up_nodes)
            * targets.scale;
        let write = calculate_rate(targets.write_base, targets.increase_per_node, targets.up_nodes)
            * targets.scale;
        self.read_limiter.set_rate(read);
        self.write_limiter.set_rate(write);
        debug!(read_rate = read, write_rate = write, "Applied request rates");
    }

    /// Evaluate every window and follow topology changes until shutdown
    pub async fn run(self: Arc<Self>, mut topology: watch::Receiver<usize>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.window);
        interval.tick().await;
        let mut topology_open = true;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.evaluate();
                }
                changed = topology.changed(), if topology_open => {
                    match changed {
                        Ok(()) => {
                            let up = *topology.borrow_and_update();
                            self.topology_changed(up);
                        }
                        Err(_) => topology_open = false,
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Rate monitor stopped");
                    break;
                }
            }
        }
    }
}
