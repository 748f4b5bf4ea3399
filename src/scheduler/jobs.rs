//! Local job table
//!
//! Per-replica record of every job this gateway accepted. It backs the
//! idempotency check on job id, the local half of `list`, and the status
//! poller.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::models::{Job, JobState};

/// In-memory job table keyed by job id
#[derive(Default)]
pub struct JobTable {
    jobs: RwLock<HashMap<String, Job>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new job unless one with the same id blocks resubmission
    ///
    /// Check and insert happen under one write lock so concurrent
    /// redeliveries of the same id cannot both get through. A job that failed
    /// before reaching any backend may be submitted again.
    pub async fn insert(&self, job: Job) -> Result<(), Job> {
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(&job.job_id) {
            if existing.blocks_resubmission() {
                return Err(existing.clone());
            }
        }
        jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// Mutate a job in place
    pub async fn update<F, R>(&self, job_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Job) -> R,
    {
        let mut jobs = self.jobs.write().await;
        jobs.get_mut(job_id).map(f)
    }

    /// Apply a lifecycle transition; `None` when the job is unknown
    pub async fn transition(&self, job_id: &str, next: JobState) -> Option<bool> {
        self.update(job_id, |job| job.transition(next)).await
    }

    /// Jobs belonging to a project, oldest first
    pub async fn by_project(&self, project: &str) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| j.project == project)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.job_id.cmp(&b.job_id)));
        matching
    }

    /// Jobs currently in any of `states`
    pub async fn in_states(&self, states: &[JobState]) -> Vec<Job> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| states.contains(&j.state))
            .cloned()
            .collect()
    }

    /// Count jobs per state
    pub async fn counts(&self) -> HashMap<JobState, usize> {
        let mut counts = HashMap::new();
        for job in self.jobs.read().await.values() {
            *counts.entry(job.state).or_insert(0) += 1;
        }
        counts
    }

    /// Drop terminal jobs that finished more than `retention` ago
    pub async fn prune_terminal(&self, retention: std::time::Duration) -> usize {
        let Ok(retention) = ChronoDuration::from_std(retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;

        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.state.is_terminal() && job.finished_at.is_some_and(|at| at < cutoff))
        });
        before - jobs.len()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}
