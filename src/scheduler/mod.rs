//! Job scheduling and load balancing
//!
//! The [`Scheduler`] turns a [`JobRequest`] into a job running on one worker
//! backend:
//!
//! ```text
//!   request ──► idempotency check ──► rotation (proxy, identity)
//!                                          │
//!                     browser needed? ─────┤
//!                            │ yes         │ no
//!                            ▼             │
//!                   admission lease        │
//!                   browser session        │
//!                            └─────────────┤
//!                                          ▼
//!                         rank Online nodes by running + pending
//!                                          │
//!                          submit with retry, fail over on
//!                          exhausted transient errors
//! ```
//!
//! Any failure after a lease was granted releases it before the error is
//! returned. Dispatched jobs are reconciled against backend listings by the
//! [`JobTracker`].
//!
//! The idempotency check has two layers: the local [`JobTable`] and the
//! [`DispatchLog`], which remembers dispatched job ids across restarts (and
//! across replicas when it lives in Redis). When the log is process-local,
//! backend listings can be consulted before dispatching a caller-supplied id.

pub mod dispatch_log;
pub mod error;
pub mod jobs;
pub mod tracker;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::{AcquireOutcome, AdmissionController, AdmissionError, Lease, WaitQueueEntry};
use crate::backend::{BackendClients, BackendError, JobListing, RemoteState};
use crate::browser::SessionProvider;
use crate::config::{AdmissionConfig, LedgerConfig};
use crate::error::ClassifiedError;
use crate::metrics;
use crate::models::{Job, JobRequest, JobSpec, JobState};
use crate::registry::{BackendNode, BackendRegistry, NodeStatus};
use crate::rotation::RotationStore;

pub use dispatch_log::{build_dispatch_log, Claim, DispatchLog, MemoryDispatchLog, RedisDispatchLog};
pub use error::{SchedulerError, SchedulerResult};
pub use jobs::JobTable;
pub use tracker::{JobTracker, TrackerSummary};

// ============================================================================
// Outcomes
// ============================================================================

/// Whether `schedule` dispatched the job or recognised a redelivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Dispatched,
    Duplicate,
}

/// Result of a successful `schedule`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub job_id: String,
    pub status: ScheduleStatus,
    pub state: JobState,
    pub node: Option<String>,
    pub proxy: Option<String>,
    pub identity: Option<String>,
    pub lease_id: Option<String>,
    pub session_id: Option<String>,
}

impl ScheduleResponse {
    fn from_job(job: &Job, status: ScheduleStatus) -> Self {
        Self {
            job_id: job.job_id.clone(),
            status,
            state: job.state,
            node: job.assigned_backend.clone(),
            proxy: job.proxy.clone(),
            identity: job.identity.clone(),
            lease_id: job.lease_id.clone(),
            session_id: job.session_id.clone(),
        }
    }
}

/// Result of `cancel`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub job_id: String,
    pub project: String,
    /// Node the job was running on, if any
    pub node: Option<String>,
    pub previous_state: String,
    pub state: String,
    /// False when the job was already terminal
    pub cancelled: bool,
    /// False when the backend could not be told
    pub remote_confirmed: bool,
}

/// One backend's part of a project listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendListing {
    pub node: String,
    pub status: NodeStatus,
    pub jobs: Option<JobListing>,
    pub error: Option<String>,
}

/// Result of `list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectListing {
    pub project: String,
    pub backends: Vec<BackendListing>,
    /// This replica's jobs for the project, grouped by state
    pub local: BTreeMap<String, Vec<Job>>,
    pub wait_queue: Vec<WaitQueueEntry>,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Places jobs on worker backends
pub struct Scheduler {
    registry: Arc<BackendRegistry>,
    clients: BackendClients,
    admission: Arc<AdmissionController>,
    rotation: Arc<RotationStore>,
    sessions: Option<Arc<dyn SessionProvider>>,
    jobs: JobTable,
    dispatch_log: Arc<dyn DispatchLog>,
    dispatch_claim: Duration,
    dispatch_retention: Duration,
    verify_remote: bool,
    browser_task_types: HashSet<String>,
    acquire_timeout: Duration,
}

impl Scheduler {
    /// Create a scheduler
    pub fn new(
        registry: Arc<BackendRegistry>,
        clients: BackendClients,
        admission: Arc<AdmissionController>,
        rotation: Arc<RotationStore>,
        config: &AdmissionConfig,
    ) -> Self {
        Self {
            registry,
            clients,
            admission,
            rotation,
            sessions: None,
            jobs: JobTable::new(),
            dispatch_log: Arc::new(MemoryDispatchLog::new()),
            dispatch_claim: config.acquire_timeout() + Duration::from_secs(60),
            dispatch_retention: tracker::TERMINAL_RETENTION,
            verify_remote: false,
            browser_task_types: config.browser_task_types.iter().cloned().collect(),
            acquire_timeout: config.acquire_timeout(),
        }
    }

    /// Record dispatched job ids in `log`
    pub fn with_dispatch_log(mut self, log: Arc<dyn DispatchLog>, config: &LedgerConfig) -> Self {
        self.dispatch_log = log;
        self.dispatch_claim = config.dispatch_claim();
        self.dispatch_retention = config.dispatch_retention();
        self
    }

    /// Look for caller-supplied job ids in backend listings before dispatching
    pub fn with_remote_check(mut self, enabled: bool) -> Self {
        self.verify_remote = enabled;
        self
    }

    /// Open a remote browser session for every admitted job
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionProvider>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn rotation(&self) -> &Arc<RotationStore> {
        &self.rotation
    }

    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    /// Whether a request needs a browser-session lease
    pub fn requires_browser(&self, request: &JobRequest) -> bool {
        request
            .browser
            .unwrap_or_else(|| self.browser_task_types.contains(&request.spider))
    }

    /// Schedule a job
    ///
    /// Idempotent on job id: a redelivery of a job that is pending, running
    /// or was already dispatched returns [`ScheduleStatus::Duplicate`]
    /// without side effects, including after a restart when the dispatch log
    /// or a backend listing still knows the id.
    pub async fn schedule(&self, request: JobRequest) -> SchedulerResult<ScheduleResponse> {
        request.validate().map_err(SchedulerError::InvalidRequest)?;

        let job_id = request
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let job = Job::from_request(job_id.clone(), &request, self.requires_browser(&request));

        if let Err(existing) = self.jobs.insert(job).await {
            info!(job_id = %job_id, state = %existing.state, "Duplicate job ignored");
            metrics::record_schedule_outcome("duplicate");
            return Ok(ScheduleResponse::from_job(&existing, ScheduleStatus::Duplicate));
        }

        match self.claim(&job_id, &request).await {
            Ok(None) => {}
            Ok(Some(response)) => {
                info!(job_id = %job_id, node = ?response.node, "Job already dispatched before, not resubmitting");
                metrics::record_schedule_outcome("duplicate");
                return Ok(response);
            }
            Err(e) => {
                let err = self.abort(&job_id, None, None, e).await;
                warn!(job_id = %job_id, kind = %err.kind(), error = %err, "Job not scheduled");
                metrics::record_schedule_outcome(err.kind().as_str());
                return Err(err);
            }
        }

        let result = self.place(&job_id, &request).await;
        if result.is_err() {
            if let Err(e) = self.dispatch_log.forget(&job_id).await {
                warn!(job_id = %job_id, error = %e, "Could not drop dispatch claim, it will expire");
            }
        }
        match &result {
            Ok(response) => {
                info!(
                    job_id = %job_id,
                    node = ?response.node,
                    lease_id = ?response.lease_id,
                    "Job dispatched"
                );
                metrics::record_schedule_outcome("dispatched");
            }
            Err(e) => {
                warn!(job_id = %job_id, kind = %e.kind(), error = %e, "Job not scheduled");
                metrics::record_schedule_outcome(e.kind().as_str());
            }
        }
        result
    }

    /// Reserve the job id in the dispatch log
    ///
    /// Returns a duplicate response when a backend already has the job.
    async fn claim(&self, job_id: &str, request: &JobRequest) -> SchedulerResult<Option<ScheduleResponse>> {
        match self.dispatch_log.claim(job_id, self.dispatch_claim).await? {
            Claim::Claimed => {}
            Claim::Dispatched { node } => return self.adopt(job_id, &node, None).await.map(Some),
            Claim::InFlight => {
                return Err(SchedulerError::InFlight {
                    job_id: job_id.to_string(),
                })
            }
        }

        if !self.verify_remote || request.job_id.is_none() {
            return Ok(None);
        }
        let Some((node, remote)) = self.find_remote(&request.project, job_id).await else {
            return Ok(None);
        };
        if let Err(e) = self.dispatch_log.commit(job_id, &node, self.dispatch_retention).await {
            warn!(job_id, node = %node, error = %e, "Could not record adopted dispatch");
        }
        self.adopt(job_id, &node, Some(remote)).await.map(Some)
    }

    /// Take over the local record of a job a backend already accepted
    ///
    /// A lease the job still holds in the ledger is picked up so the tracker
    /// renews and releases it.
    async fn adopt(&self, job_id: &str, node: &str, remote: Option<RemoteState>) -> SchedulerResult<ScheduleResponse> {
        let requires_browser = self
            .jobs
            .get(job_id)
            .await
            .is_some_and(|j| j.requires_browser);
        let lease_id = if requires_browser {
            match self.admission.poll(job_id).await {
                Ok(AcquireOutcome::Granted(lease)) => Some(lease.lease_id),
                Ok(_) => None,
                Err(e) => {
                    debug!(job_id, error = %e, "Lease lookup for adopted job failed");
                    None
                }
            }
        } else {
            None
        };

        let job = self
            .jobs
            .update(job_id, |job| {
                job.assigned_backend = Some(node.to_string());
                job.lease_id = lease_id.clone();
                job.transition(JobState::Dispatched);
                match remote {
                    Some(RemoteState::Running) => {
                        job.transition(JobState::Running);
                    }
                    Some(RemoteState::Finished) => {
                        job.transition(JobState::Finished);
                    }
                    _ => {}
                }
                job.clone()
            })
            .await
            .ok_or_else(|| SchedulerError::not_found(job_id))?;

        if job.state == JobState::Finished {
            self.release_resources(job_id, lease_id.as_deref(), None).await;
        }
        Ok(ScheduleResponse::from_job(&job, ScheduleStatus::Duplicate))
    }

    /// Search the listings of online backends for a job id
    async fn find_remote(&self, project: &str, job_id: &str) -> Option<(String, RemoteState)> {
        let online = rank_nodes(self.registry.snapshot().await);
        let requests = online.iter().filter_map(|node| {
            let client = Arc::clone(self.clients.get(&node.id)?);
            let node_id = node.id.clone();
            Some(async move { (node_id, client.list_jobs(project).await) })
        });

        for (node, result) in join_all(requests).await {
            match result {
                Ok(listing) => {
                    if let Some(state) = listing.find(job_id) {
                        return Some((node, state));
                    }
                }
                Err(e) => debug!(job_id, node = %node, error = %e, "Listing unavailable for redelivery check"),
            }
        }
        None
    }

    async fn place(&self, job_id: &str, request: &JobRequest) -> SchedulerResult<ScheduleResponse> {
        let resolved = self.rotation.resolve(request).await;
        let Some((requires_browser, state)) = self
            .jobs
            .update(job_id, |job| {
                job.proxy = resolved.proxy.clone();
                job.identity = resolved.identity.clone();
                (job.requires_browser, job.state)
            })
            .await
        else {
            return Err(SchedulerError::not_found(job_id));
        };

        // Cancelled before admission: never join the wait queue
        if state == JobState::Cancelled {
            return Err(SchedulerError::cancelled(job_id));
        }

        let mut lease: Option<Lease> = None;
        let mut session_id: Option<String> = None;
        let mut extra_settings: Vec<(String, String)> = Vec::new();

        if requires_browser {
            let granted = match self.admission.acquire(job_id, self.acquire_timeout).await {
                Ok(granted) => granted,
                Err(e) => {
                    let err = self.admission_failure(job_id, e).await;
                    return Err(self.abort(job_id, None, None, err).await);
                }
            };

            let admitted = self
                .jobs
                .update(job_id, |job| {
                    job.lease_id = Some(granted.lease_id.clone());
                    job.transition(JobState::Admitted)
                })
                .await
                .unwrap_or(false);
            lease = Some(granted);
            if !admitted {
                return Err(self.abort(job_id, lease.as_ref(), None, SchedulerError::cancelled(job_id)).await);
            }

            if let Some(sessions) = &self.sessions {
                match sessions.create(job_id).await {
                    Ok(session) => {
                        debug!(job_id, session_id = %session.session_id, "Browser session opened");
                        extra_settings.extend(session.settings());
                        session_id = Some(session.session_id.clone());
                        self.jobs
                            .update(job_id, |job| job.session_id = Some(session.session_id))
                            .await;
                    }
                    Err(e) => {
                        return Err(self.abort(job_id, lease.as_ref(), None, e.into()).await);
                    }
                }
            }
        }

        let Some(job) = self.jobs.get(job_id).await else {
            return Err(self
                .abort(job_id, lease.as_ref(), session_id.as_deref(), SchedulerError::not_found(job_id))
                .await);
        };
        let spec = extra_settings
            .into_iter()
            .fold(JobSpec::from_job(&job), |spec, (k, v)| spec.with_setting(k, v));

        let candidates = rank_nodes(self.registry.snapshot().await);
        if candidates.is_empty() {
            return Err(self
                .abort(job_id, lease.as_ref(), session_id.as_deref(), SchedulerError::NoCapacity)
                .await);
        }

        let mut attempts: Vec<String> = Vec::new();
        for node in candidates {
            let Some(client) = self.clients.get(&node.id) else {
                continue;
            };

            match client.submit(&spec).await {
                Ok(remote_id) => {
                    if remote_id != job_id {
                        debug!(job_id, remote_id = %remote_id, "Backend assigned a different job id");
                    }
                    if let Err(e) = self.dispatch_log.commit(job_id, &node.id, self.dispatch_retention).await {
                        warn!(job_id, node = %node.id, error = %e, "Could not record dispatch, a redelivery may resubmit");
                    }
                    return self
                        .commit_dispatch(job_id, &node.id, lease.as_ref(), session_id.as_deref())
                        .await;
                }
                Err(e) if e.is_transient() => {
                    warn!(job_id, node = %node.id, error = %e, "Dispatch failed after retries, trying next node");
                    self.registry.mark_offline(&node.id, &e.to_string()).await;
                    metrics::record_dispatch_failure(&node.id);
                    attempts.push(format!("{}: {}", node.id, e));
                }
                Err(e) => {
                    let err = rejected(job_id, &node.id, e);
                    return Err(self.abort(job_id, lease.as_ref(), session_id.as_deref(), err).await);
                }
            }
        }

        let err = SchedulerError::BackendUnreachable {
            job_id: job_id.to_string(),
            attempts: attempts.join("; "),
        };
        Err(self.abort(job_id, lease.as_ref(), session_id.as_deref(), err).await)
    }

    async fn commit_dispatch(
        &self,
        job_id: &str,
        node_id: &str,
        lease: Option<&Lease>,
        session_id: Option<&str>,
    ) -> SchedulerResult<ScheduleResponse> {
        let updated = self
            .jobs
            .update(job_id, |job| {
                job.assigned_backend = Some(node_id.to_string());
                job.transition(JobState::Dispatched).then(|| job.clone())
            })
            .await
            .flatten();
        self.registry.note_dispatch(node_id).await;

        match updated {
            Some(job) => Ok(ScheduleResponse::from_job(&job, ScheduleStatus::Dispatched)),
            None => {
                // Cancelled while the submit was in flight
                let project = self.jobs.get(job_id).await.map(|j| j.project).unwrap_or_default();
                if let Some(client) = self.clients.get(node_id) {
                    if let Err(e) = client.cancel(&project, job_id).await {
                        warn!(job_id, node = node_id, error = %e, "Could not cancel job dispatched during cancellation");
                    }
                }
                self.release_resources(job_id, lease.map(|l| l.lease_id.as_str()), session_id)
                    .await;
                Err(SchedulerError::cancelled(job_id))
            }
        }
    }

    /// Release what a failed job held and record the failure
    async fn abort(
        &self,
        job_id: &str,
        lease: Option<&Lease>,
        session_id: Option<&str>,
        err: SchedulerError,
    ) -> SchedulerError {
        self.release_resources(job_id, lease.map(|l| l.lease_id.as_str()), session_id)
            .await;

        let message = err.to_string();
        let failed = self
            .jobs
            .update(job_id, |job| {
                job.last_error = Some(message);
                job.transition(JobState::Failed)
            })
            .await
            .unwrap_or(false);

        if !failed && !matches!(err, SchedulerError::Cancelled { .. }) {
            let cancelled = self
                .jobs
                .get(job_id)
                .await
                .is_some_and(|j| j.state == JobState::Cancelled);
            if cancelled {
                return SchedulerError::cancelled(job_id);
            }
        }
        err
    }

    async fn admission_failure(&self, job_id: &str, err: AdmissionError) -> SchedulerError {
        if matches!(err, AdmissionError::Dequeued { .. }) {
            let cancelled = self
                .jobs
                .get(job_id)
                .await
                .is_some_and(|j| j.state == JobState::Cancelled);
            if cancelled {
                return SchedulerError::cancelled(job_id);
            }
        }
        SchedulerError::from_admission(job_id, err)
    }

    /// Release a lease and close a browser session; failures are logged only
    pub(crate) async fn release_resources(&self, job_id: &str, lease_id: Option<&str>, session_id: Option<&str>) {
        if let Some(lease_id) = lease_id {
            if let Err(e) = self.admission.release(lease_id).await {
                warn!(job_id, lease_id, error = %e, "Failed to release lease, it will expire");
            }
        }
        if let (Some(session_id), Some(sessions)) = (session_id, &self.sessions) {
            if let Err(e) = sessions.destroy(session_id).await {
                warn!(job_id, session_id, error = %e, "Failed to close browser session");
            }
        }
    }

    /// Cancel a job
    pub async fn cancel(&self, project: &str, job_id: &str) -> SchedulerResult<CancelOutcome> {
        let job = match self.jobs.get(job_id).await {
            Some(job) if job.project == project => job,
            _ => return self.cancel_remote(project, job_id).await,
        };

        let previous = job.state;
        let mut outcome = CancelOutcome {
            job_id: job_id.to_string(),
            project: project.to_string(),
            node: job.assigned_backend.clone(),
            previous_state: previous.to_string(),
            state: previous.to_string(),
            cancelled: false,
            remote_confirmed: true,
        };

        if previous.is_terminal() {
            debug!(job_id, state = %previous, "Cancel of terminal job ignored");
            return Ok(outcome);
        }

        // Mark first so an in-flight schedule observes the cancellation
        let snapshot = self
            .jobs
            .update(job_id, |j| j.transition(JobState::Cancelled).then(|| j.clone()))
            .await
            .flatten();
        let Some(current) = snapshot else {
            // Lost a race with a terminal transition
            let state = self.jobs.get(job_id).await.map(|j| j.state).unwrap_or(previous);
            outcome.state = state.to_string();
            return Ok(outcome);
        };
        outcome.cancelled = true;
        outcome.state = JobState::Cancelled.to_string();

        if previous.is_local() {
            if current.requires_browser {
                let released = self.admission.cancel_waiting(job_id).await;
                if let Err(e) = released {
                    warn!(job_id, error = %e, "Could not remove job from admission");
                }
            }
            if let (Some(session_id), Some(sessions)) = (current.session_id.as_deref(), &self.sessions) {
                if let Err(e) = sessions.destroy(session_id).await {
                    warn!(job_id, session_id, error = %e, "Failed to close browser session");
                }
            }
            info!(job_id, previous = %previous, "Queued job cancelled");
            return Ok(outcome);
        }

        let node_id = current.assigned_backend.clone().unwrap_or_default();
        match self.clients.get(&node_id) {
            Some(client) => match client.cancel(project, job_id).await {
                Ok(prevstate) => {
                    debug!(job_id, node = %node_id, prevstate = ?prevstate, "Backend confirmed cancel");
                }
                Err(e) => {
                    warn!(job_id, node = %node_id, error = %e, "Backend unreachable, job cancelled locally only");
                    outcome.remote_confirmed = false;
                }
            },
            None => outcome.remote_confirmed = false,
        }

        self.release_resources(job_id, current.lease_id.as_deref(), current.session_id.as_deref())
            .await;
        info!(job_id, node = %node_id, remote_confirmed = outcome.remote_confirmed, "Job cancelled");
        Ok(outcome)
    }

    /// Cancel a job this replica never saw by searching every backend
    async fn cancel_remote(&self, project: &str, job_id: &str) -> SchedulerResult<CancelOutcome> {
        let listings = self.fetch_listings(project).await;

        for (node_id, listing) in listings {
            let Ok(listing) = listing else {
                continue;
            };
            let Some(remote_state) = listing.find(job_id) else {
                continue;
            };

            let previous = match remote_state {
                RemoteState::Pending => JobState::Dispatched,
                RemoteState::Running => JobState::Running,
                RemoteState::Finished => JobState::Finished,
            };
            let mut outcome = CancelOutcome {
                job_id: job_id.to_string(),
                project: project.to_string(),
                node: Some(node_id.clone()),
                previous_state: previous.to_string(),
                state: previous.to_string(),
                cancelled: false,
                remote_confirmed: true,
            };
            if remote_state == RemoteState::Finished {
                return Ok(outcome);
            }

            if let Some(client) = self.clients.get(&node_id) {
                match client.cancel(project, job_id).await {
                    Ok(_) => {
                        outcome.cancelled = true;
                        outcome.state = JobState::Cancelled.to_string();
                        info!(job_id, node = %node_id, "Remote job cancelled");
                    }
                    Err(e) => {
                        warn!(job_id, node = %node_id, error = %e, "Remote cancel failed");
                        outcome.remote_confirmed = false;
                    }
                }
            }
            return Ok(outcome);
        }

        Err(SchedulerError::not_found(job_id))
    }

    async fn fetch_listings(&self, project: &str) -> Vec<(String, Result<JobListing, BackendError>)> {
        let requests = self.clients.iter().map(|(id, client)| {
            let client = Arc::clone(client);
            async move { (id.clone(), client.list_jobs(project).await) }
        });
        join_all(requests).await
    }

    /// Jobs for a project across every backend, plus this replica's view
    pub async fn list(&self, project: &str) -> SchedulerResult<ProjectListing> {
        let snapshot = self.registry.snapshot().await;
        let listings = self.fetch_listings(project).await;

        let backends = listings
            .into_iter()
            .map(|(node, result)| {
                let status = snapshot
                    .iter()
                    .find(|n| n.id == node)
                    .map(|n| n.status)
                    .unwrap_or_default();
                match result {
                    Ok(jobs) => BackendListing {
                        node,
                        status,
                        jobs: Some(jobs),
                        error: None,
                    },
                    Err(e) => BackendListing {
                        node,
                        status,
                        jobs: None,
                        error: Some(e.to_string()),
                    },
                }
            })
            .collect();

        let mut local: BTreeMap<String, Vec<Job>> = BTreeMap::new();
        for job in self.jobs.by_project(project).await {
            local.entry(job.state.to_string()).or_default().push(job);
        }

        let wait_queue = match self.admission.status().await {
            Ok(status) => status.wait_queue,
            Err(e) => {
                warn!(error = %e, "Admission status unavailable for listing");
                Vec::new()
            }
        };

        Ok(ProjectListing {
            project: project.to_string(),
            backends,
            local,
            wait_queue,
        })
    }

    /// Local view of one job
    pub async fn job(&self, job_id: &str) -> SchedulerResult<Job> {
        self.jobs
            .get(job_id)
            .await
            .ok_or_else(|| SchedulerError::not_found(job_id))
    }
}

/// Online nodes ordered by `running + pending`, ties broken by node id
pub fn rank_nodes(nodes: Vec<BackendNode>) -> Vec<BackendNode> {
    let mut candidates: Vec<BackendNode> = nodes
        .into_iter()
        .filter(|n| n.status.is_schedulable())
        .collect();
    candidates.sort_by(|a, b| a.load().cmp(&b.load()).then_with(|| a.id.cmp(&b.id)));
    candidates
}

fn rejected(job_id: &str, node_id: &str, err: BackendError) -> SchedulerError {
    let message = match err {
        BackendError::Rejected { message, .. } | BackendError::InvalidResponse { message, .. } => message,
        BackendError::Http { status, message, .. } => format!("HTTP {status}: {message}"),
        other => other.to_string(),
    };
    SchedulerError::BackendRejected {
        job_id: job_id.to_string(),
        node: node_id.to_string(),
        message,
    }
}
