//! Node registry for tracking storage cluster members
//!
//! Request limits scale with the number of storage nodes that are up, so the
//! registry publishes the live up-node count on a watch channel. Rate limiters
//! subscribe and recompute their targets whenever it changes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Status of a storage node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Node is serving requests
    Up,
    /// Node is bootstrapping and not yet serving
    Joining,
    /// Node is decommissioning
    Leaving,
    /// Node missed heartbeats or was reported down
    Down,
}

/// Information about a storage node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageNode {
    /// Node address (host or host:port)
    pub address: String,
    pub status: NodeStatus,
    #[serde(skip, default = "Instant::now")]
    pub last_heartbeat: Instant,
}

impl StorageNode {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            status: NodeStatus::Up,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_up(&self) -> bool {
        matches!(self.status, NodeStatus::Up)
    }
}

/// Registry of storage nodes keyed by address
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, StorageNode>>,
    up_count: watch::Sender<usize>,
    /// Node timeout duration
    timeout: Duration,
}

impl NodeRegistry {
    pub fn new(timeout_secs: u64) -> Self {
        let (up_count, _) = watch::channel(0);
        Self {
            nodes: RwLock::new(HashMap::new()),
            up_count,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Registry pre-populated with nodes that are all up
    pub fn with_nodes<I, S>(timeout_secs: u64, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes: HashMap<String, StorageNode> = addresses
            .into_iter()
            .map(|a| {
                let node = StorageNode::new(a);
                (node.address.clone(), node)
            })
            .collect();
        let (up_count, _) = watch::channel(nodes.len());
        Self {
            nodes: RwLock::new(nodes),
            up_count,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Register a new node or update an existing one
    pub async fn register_node(&self, node: StorageNode) {
        let mut nodes = self.nodes.write().await;
        info!(address = %node.address, status = ?node.status, "Registering storage node");
        nodes.insert(node.address.clone(), node);
        self.publish(&nodes);
    }

    /// Change a node's status. Returns false for unknown nodes.
    pub async fn set_status(&self, address: &str, status: NodeStatus) -> bool {
        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get_mut(address) else {
            warn!(address, "Status change for unknown storage node");
            return false;
        };
        if node.status != status {
            info!(address, from = ?node.status, to = ?status, "Storage node status changed");
            node.status = status;
        }
        self.publish(&nodes);
        true
    }

    /// Update node heartbeat; a down node that heartbeats is back up.
    pub async fn heartbeat(&self, address: &str) -> bool {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(address) {
            node.last_heartbeat = Instant::now();
            if matches!(node.status, NodeStatus::Down) {
                node.status = NodeStatus::Up;
                info!(address, "Storage node recovered");
            }
            self.publish(&nodes);
            true
        } else {
            warn!(address, "Heartbeat from unknown storage node");
            false
        }
    }

    /// Record a heartbeat for every node that is up. Down nodes stay down.
    pub async fn refresh_up_nodes(&self) {
        let now = Instant::now();
        let mut nodes = self.nodes.write().await;
        for node in nodes.values_mut().filter(|n| n.is_up()) {
            node.last_heartbeat = now;
        }
    }

    pub async fn remove_node(&self, address: &str) {
        let mut nodes = self.nodes.write().await;
        if nodes.remove(address).is_some() {
            info!(address, "Removed storage node from registry");
        }
        self.publish(&nodes);
    }

    pub async fn get_all_nodes(&self) -> Vec<StorageNode> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Current number of nodes that are up
    pub fn up_count(&self) -> usize {
        *self.up_count.borrow()
    }

    /// Subscribe to changes of the up-node count
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.up_count.subscribe()
    }

    /// Mark nodes that missed their heartbeat window as down
    pub async fn check_health(&self) {
        let mut nodes = self.nodes.write().await;
        let now = Instant::now();
        for node in nodes.values_mut() {
            let elapsed = now.duration_since(node.last_heartbeat);
            if elapsed > self.timeout && node.is_up() {
                warn!(
                    address = %node.address,
                    elapsed_secs = elapsed.as_secs(),
                    "Storage node missed heartbeat, marking as down"
                );
                node.status = NodeStatus::Down;
            }
        }
        self.publish(&nodes);
    }

    /// Run periodic health checks until shutdown
    pub async fn run_health_checks(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = interval.tick() => self.check_health().await,
                _ = shutdown.cancelled() => {
                    debug!("Node health checks stopped");
                    break;
                }
            }
        }
    }

    fn publish(&self, nodes: &HashMap<String, StorageNode>) {
        let up = nodes.values().filter(|n| n.is_up()).count();
        self.up_count.send_if_modified(|current| {
            if *current != up {
                debug!(from = *current, to = up, "Up-node count changed");
                *current = up;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_node_registration_updates_up_count() {
        let registry = NodeRegistry::new(30);
        assert_eq!(registry.up_count(), 0);

        registry.register_node(StorageNode::new("10.0.0.1")).await;
        registry
            .register_node(StorageNode::new("10.0.0.2").with_status(NodeStatus::Joining))
            .await;

        assert_eq!(registry.up_count(), 1);
        assert_eq!(registry.get_all_nodes().await.len(), 2);
    }

    #[tokio::test]
    async fn test_status_change_notifies_subscribers() {
        let registry = NodeRegistry::with_nodes(30, ["a", "b", "c"]);
        let mut rx = registry.subscribe();
        assert_eq!(*rx.borrow_and_update(), 3);

        assert!(registry.set_status("b", NodeStatus::Down).await);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 2);

        assert!(!registry.set_status("zz", NodeStatus::Down).await);
    }

    #[tokio::test]
    async fn test_heartbeat_recovers_down_node() {
        let registry = NodeRegistry::with_nodes(30, ["a"]);
        registry.set_status("a", NodeStatus::Down).await;
        assert_eq!(registry.up_count(), 0);

        assert!(registry.heartbeat("a").await);
        assert_eq!(registry.up_count(), 1);
        assert!(!registry.heartbeat("b").await);
    }

    #[tokio::test]
    async fn test_health_checks_mark_silent_nodes_down() {
        let registry = Arc::new(NodeRegistry::with_nodes(0, ["a", "b"]));
        let mut rx = registry.subscribe();
        std::thread::sleep(Duration::from_millis(5));

        let shutdown = CancellationToken::new();
        let checks = tokio::spawn({
            let registry = registry.clone();
            let shutdown = shutdown.clone();
            async move { registry.run_health_checks(shutdown).await }
        });

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.up_count(), 0);

        // Refreshing does not revive down nodes
        registry.refresh_up_nodes().await;
        assert_eq!(registry.up_count(), 0);

        shutdown.cancel();
        checks.await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_node() {
        let registry = NodeRegistry::with_nodes(30, ["a", "b"]);
        registry.remove_node("a").await;
        assert_eq!(registry.up_count(), 1);
    }
}
