//! Health prober
//!
//! One independent loop per backend, so a slow or dead node never delays
//! visibility into the others. Offline nodes keep being probed and come back
//! on the first successful status request.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::{BackendRegistry, NodeStatus};
use crate::backend::{BackendClient, BackendClients};
use crate::metrics;

/// Periodically probes every backend and feeds the registry
pub struct HealthProber {
    registry: Arc<BackendRegistry>,
    clients: BackendClients,
    probe_interval: Duration,
}

impl HealthProber {
    pub fn new(registry: Arc<BackendRegistry>, clients: BackendClients, probe_interval: Duration) -> Self {
        Self {
            registry,
            clients,
            probe_interval,
        }
    }

    /// Probe one node once and record the result
    pub async fn probe(&self, node_id: &str) -> Option<NodeStatus> {
        let client = self.clients.get(node_id)?;
        probe_node(&self.registry, client.as_ref()).await
    }

    /// Probe every node once, concurrently
    pub async fn probe_all(&self) {
        let probes = self
            .clients
            .values()
            .map(|client| probe_node(&self.registry, client.as_ref()));
        futures::future::join_all(probes).await;
    }

    /// Spawn one probe loop per node
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.clients
            .values()
            .map(|client| {
                let registry = Arc::clone(&self.registry);
                let client = Arc::clone(client);
                let mut shutdown_rx = shutdown.clone();
                let probe_interval = self.probe_interval;

                tokio::spawn(async move {
                    let mut ticker = interval(probe_interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                probe_node(&registry, client.as_ref()).await;
                            }
                            _ = shutdown_rx.changed() => {
                                tracing::debug!(node = client.node_id(), "Probe loop shutting down");
                                break;
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

async fn probe_node(registry: &BackendRegistry, client: &dyn BackendClient) -> Option<NodeStatus> {
    let node = client.node_id();

    match client.status().await {
        Ok(status) => {
            let previous = registry.record_success(node, &status).await?;
            if previous != NodeStatus::Online {
                tracing::info!(
                    node,
                    running = status.running,
                    pending = status.pending,
                    "Backend online"
                );
            }
            metrics::update_backend_metrics(node, true, status.load());
            Some(NodeStatus::Online)
        }
        Err(e) => {
            let message = e.to_string();
            let before = registry.get(node).await.map(|n| n.status);
            let after = registry.record_failure(node, &message).await?;
            metrics::record_probe_failure(node);

            if after == NodeStatus::Offline && before != Some(NodeStatus::Offline) {
                tracing::warn!(node, error = %message, "Backend marked offline");
                metrics::update_backend_metrics(node, false, 0);
            } else {
                tracing::debug!(node, error = %message, "Probe failed");
            }
            Some(after)
        }
    }
}
