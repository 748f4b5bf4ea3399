//! Backend registry
//!
//! Holds the last-probed view of every configured worker backend. The view is
//! per replica and eventually consistent: it is written by the
//! [`HealthProber`] (plus an optimistic pending bump on dispatch) and read by
//! the scheduler through [`BackendRegistry::snapshot`], which never touches
//! the network.

pub mod prober;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::backend::DaemonStatus;
use crate::config::BackendConfig;

pub use prober::HealthProber;

// ============================================================================
// Node Status
// ============================================================================

/// Reachability of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Last probe succeeded
    Online,

    /// Failed `failure_threshold` probes in a row, or dispatch retries exhausted
    Offline,

    /// Not probed yet
    #[default]
    Unknown,
}

impl NodeStatus {
    /// Only online nodes receive new jobs
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Online)
    }
}

// ============================================================================
// Backend Node
// ============================================================================

/// A worker backend as seen by this replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendNode {
    pub id: String,

    pub base_url: String,

    /// Whether basic-auth credentials are configured (the secret never leaves the client)
    pub has_credentials: bool,

    pub status: NodeStatus,

    pub running: u32,

    pub pending: u32,

    pub finished: u32,

    pub consecutive_failures: u32,

    pub last_probe_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
}

impl BackendNode {
    /// Create an unprobed node from configuration
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            id: config.id.clone(),
            base_url: config.url.clone(),
            has_credentials: config.username.is_some(),
            status: NodeStatus::Unknown,
            running: 0,
            pending: 0,
            finished: 0,
            consecutive_failures: 0,
            last_probe_at: None,
            last_error: None,
        }
    }

    /// Load metric used for ranking
    pub fn load(&self) -> u32 {
        self.running.saturating_add(self.pending)
    }
}

// ============================================================================
// Backend Registry
// ============================================================================

/// Registry of statically configured backends
pub struct BackendRegistry {
    /// Nodes keyed by id
    nodes: Arc<RwLock<BTreeMap<String, BackendNode>>>,

    /// Consecutive failures before a node goes offline
    failure_threshold: u32,
}

impl BackendRegistry {
    /// Create a registry; every node starts `Unknown`
    pub fn new(backends: &[BackendConfig], failure_threshold: u32) -> Self {
        let nodes = backends
            .iter()
            .map(|b| (b.id.clone(), BackendNode::from_config(b)))
            .collect();

        Self {
            nodes: Arc::new(RwLock::new(nodes)),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Immutable copy of the current view, ordered by node id
    pub async fn snapshot(&self) -> Vec<BackendNode> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Get one node
    pub async fn get(&self, id: &str) -> Option<BackendNode> {
        self.nodes.read().await.get(id).cloned()
    }

    /// Node ids in order
    pub async fn node_ids(&self) -> Vec<String> {
        self.nodes.read().await.keys().cloned().collect()
    }

    /// Apply a successful probe
    pub async fn record_success(&self, id: &str, status: &DaemonStatus) -> Option<NodeStatus> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(id)?;

        let previous = node.status;
        node.status = NodeStatus::Online;
        node.running = status.running;
        node.pending = status.pending;
        node.finished = status.finished;
        node.consecutive_failures = 0;
        node.last_probe_at = Some(Utc::now());
        node.last_error = None;

        Some(previous)
    }

    /// Apply a failed probe; returns the resulting status
    pub async fn record_failure(&self, id: &str, error: &str) -> Option<NodeStatus> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(id)?;

        node.consecutive_failures = node.consecutive_failures.saturating_add(1);
        node.last_probe_at = Some(Utc::now());
        node.last_error = Some(error.to_string());
        if node.consecutive_failures >= self.failure_threshold {
            node.status = NodeStatus::Offline;
        }

        Some(node.status)
    }

    /// Count a dispatch against a node until the next probe corrects it
    pub async fn note_dispatch(&self, id: &str) {
        if let Some(node) = self.nodes.write().await.get_mut(id) {
            node.pending = node.pending.saturating_add(1);
        }
    }

    /// Exclude a node from scheduling until a probe succeeds again
    pub async fn mark_offline(&self, id: &str, error: &str) {
        if let Some(node) = self.nodes.write().await.get_mut(id) {
            node.status = NodeStatus::Offline;
            node.last_error = Some(error.to_string());
        }
    }

    /// Get registry statistics
    pub async fn stats(&self) -> RegistryStats {
        let nodes = self.nodes.read().await;

        let mut stats = RegistryStats {
            total_nodes: nodes.len(),
            ..Default::default()
        };

        for node in nodes.values() {
            match node.status {
                NodeStatus::Online => stats.online += 1,
                NodeStatus::Offline => stats.offline += 1,
                NodeStatus::Unknown => stats.unknown += 1,
            }
            stats.total_running += u64::from(node.running);
            stats.total_pending += u64::from(node.pending);
        }

        stats
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_nodes: usize,
    pub online: usize,
    pub offline: usize,
    pub unknown: usize,
    pub total_running: u64,
    pub total_pending: u64,
}

impl RegistryStats {
    /// Get availability percentage
    pub fn availability(&self) -> f64 {
        if self.total_nodes == 0 {
            0.0
        } else {
            (self.online as f64 / self.total_nodes as f64) * 100.0
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> BackendRegistry {
        BackendRegistry::new(
            &[
                BackendConfig::new("b", "http://b:6800"),
                BackendConfig::new("a", "http://a:6800").with_credentials("u", "p"),
            ],
            3,
        )
    }

    fn status(running: u32, pending: u32) -> DaemonStatus {
        DaemonStatus {
            running,
            pending,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_nodes_start_unknown_and_sorted() {
        let snapshot = registry().snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "a");
        assert!(snapshot[0].has_credentials);
        assert!(snapshot.iter().all(|n| n.status == NodeStatus::Unknown));
    }

    #[tokio::test]
    async fn test_success_updates_counts() {
        let registry = registry();
        registry.record_success("a", &status(2, 1)).await;

        let node = registry.get("a").await.unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.load(), 3);
        assert!(node.last_probe_at.is_some());
    }

    #[tokio::test]
    async fn test_offline_after_threshold_and_recovers() {
        let registry = registry();
        registry.record_success("a", &status(0, 0)).await;

        assert_eq!(registry.record_failure("a", "refused").await, Some(NodeStatus::Online));
        assert_eq!(registry.record_failure("a", "refused").await, Some(NodeStatus::Online));
        assert_eq!(registry.record_failure("a", "refused").await, Some(NodeStatus::Offline));

        registry.record_success("a", &status(0, 0)).await;
        let node = registry.get("a").await.unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.consecutive_failures, 0);
        assert!(node.last_error.is_none());
    }

    #[tokio::test]
    async fn test_note_dispatch_and_mark_offline() {
        let registry = registry();
        registry.record_success("b", &status(1, 0)).await;
        registry.note_dispatch("b").await;
        assert_eq!(registry.get("b").await.unwrap().load(), 2);

        registry.mark_offline("b", "dispatch failed").await;
        assert_eq!(registry.get("b").await.unwrap().status, NodeStatus::Offline);
    }

    #[tokio::test]
    async fn test_stats() {
        let registry = registry();
        registry.record_success("a", &status(2, 3)).await;

        let stats = registry.stats().await;
        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.online, 1);
        assert_eq!(stats.unknown, 1);
        assert_eq!(stats.total_running, 2);
        assert_eq!(stats.total_pending, 3);
        assert!((stats.availability() - 50.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn test_unknown_node_is_ignored() {
        let registry = registry();
        assert!(registry.record_failure("zz", "x").await.is_none());
        registry.note_dispatch("zz").await;
    }
}
