//! Job status poller
//!
//! Reconciles dispatched jobs against backend listings. A job seen running
//! keeps its lease renewed; a finished job gives its lease and browser
//! session back. Jobs a backend no longer lists are left alone and their
//! leases fall to the TTL sweep.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Scheduler;
use crate::backend::RemoteState;
use crate::models::{Job, JobState};

/// How long terminal jobs stay in the local table
pub(crate) const TERMINAL_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Counters from one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerSummary {
    pub checked: usize,
    pub running: usize,
    pub finished: usize,
    pub renewed: usize,
    pub unreachable_nodes: usize,
}

/// Periodically reconciles dispatched jobs
pub struct JobTracker {
    scheduler: Arc<Scheduler>,
    interval: Duration,
}

impl JobTracker {
    pub fn new(scheduler: Arc<Scheduler>, interval: Duration) -> Self {
        Self { scheduler, interval }
    }

    /// One pass over every dispatched or running job
    pub async fn reconcile(&self) -> TrackerSummary {
        let mut summary = TrackerSummary::default();
        let jobs = self
            .scheduler
            .jobs()
            .in_states(&[JobState::Dispatched, JobState::Running])
            .await;

        // One listing call per (node, project)
        let mut groups: BTreeMap<(String, String), Vec<Job>> = BTreeMap::new();
        for job in jobs {
            if let Some(node) = job.assigned_backend.clone() {
                groups.entry((node, job.project.clone())).or_default().push(job);
            }
        }

        for ((node, project), jobs) in groups {
            let Some(client) = self.scheduler.clients.get(&node) else {
                continue;
            };
            let listing = match client.list_jobs(&project).await {
                Ok(listing) => listing,
                Err(e) => {
                    debug!(node = %node, project = %project, error = %e, "Job listing unavailable");
                    summary.unreachable_nodes += 1;
                    continue;
                }
            };

            for job in jobs {
                summary.checked += 1;
                match listing.find(&job.job_id) {
                    Some(RemoteState::Running) => {
                        self.scheduler.jobs().transition(&job.job_id, JobState::Running).await;
                        summary.running += 1;
                        if self.renew(&job).await {
                            summary.renewed += 1;
                        }
                    }
                    Some(RemoteState::Pending) => {
                        if self.renew(&job).await {
                            summary.renewed += 1;
                        }
                    }
                    Some(RemoteState::Finished) => {
                        self.finish(&job).await;
                        summary.finished += 1;
                    }
                    None => {}
                }
            }
        }

        let pruned = self.scheduler.jobs().prune_terminal(TERMINAL_RETENTION).await;
        if pruned > 0 {
            debug!(pruned, "Pruned terminal jobs");
        }
        summary
    }

    async fn renew(&self, job: &Job) -> bool {
        let Some(lease_id) = job.lease_id.as_deref() else {
            return false;
        };
        match self.scheduler.admission().renew(lease_id).await {
            Ok(Some(_)) => true,
            Ok(None) => {
                warn!(job_id = %job.job_id, lease_id, "Lease already expired for running job");
                false
            }
            Err(e) => {
                warn!(job_id = %job.job_id, lease_id, error = %e, "Lease renewal failed");
                false
            }
        }
    }

    async fn finish(&self, job: &Job) {
        let finished = self
            .scheduler
            .jobs()
            .transition(&job.job_id, JobState::Finished)
            .await
            .unwrap_or(false);
        if !finished {
            return;
        }
        info!(job_id = %job.job_id, node = ?job.assigned_backend, "Job finished");
        self.scheduler
            .release_resources(&job.job_id, job.lease_id.as_deref(), job.session_id.as_deref())
            .await;
    }

    /// Run `reconcile` every interval until shutdown
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = self.reconcile().await;
                        if summary.checked > 0 {
                            debug!(?summary, "Job status reconciled");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Job tracker shutting down");
                        break;
                    }
                }
            }
        })
    }
}
