//! Worker backend protocol
//!
//! Backends are Scrapyd-compatible crawl nodes. The scheduler and the health
//! prober only see the [`BackendClient`] trait; [`HttpBackendClient`] is the
//! production implementation.

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::GatewayConfig;
use crate::error::{ClassifiedError, ErrorKind};
use crate::models::JobSpec;

pub use client::HttpBackendClient;

/// Node-reported load, as returned by `daemonstatus.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    #[serde(default)]
    pub running: u32,
    #[serde(default)]
    pub pending: u32,
    #[serde(default)]
    pub finished: u32,
    #[serde(default)]
    pub node_name: Option<String>,
}

impl DaemonStatus {
    /// Reported `running + pending`, saturating on absurd counts
    pub fn load(&self) -> u32 {
        self.running.saturating_add(self.pending)
    }
}

/// A job as reported by a backend's `listjobs.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJob {
    pub id: String,
    #[serde(default)]
    pub spider: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

/// Per-backend job listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobListing {
    #[serde(default)]
    pub pending: Vec<RemoteJob>,
    #[serde(default)]
    pub running: Vec<RemoteJob>,
    #[serde(default)]
    pub finished: Vec<RemoteJob>,
}

/// Where a job sits in a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Pending,
    Running,
    Finished,
}

impl JobListing {
    /// Locate a job id in the listing
    pub fn find(&self, job_id: &str) -> Option<RemoteState> {
        if self.running.iter().any(|j| j.id == job_id) {
            Some(RemoteState::Running)
        } else if self.pending.iter().any(|j| j.id == job_id) {
            Some(RemoteState::Pending)
        } else if self.finished.iter().any(|j| j.id == job_id) {
            Some(RemoteState::Finished)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.running.len() + self.finished.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Client for one worker backend
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Node identifier this client talks to
    fn node_id(&self) -> &str;

    /// Single bounded-timeout status request (never retried)
    async fn status(&self) -> Result<DaemonStatus, BackendError>;

    /// Submit a job; returns the backend's job id
    async fn submit(&self, spec: &JobSpec) -> Result<String, BackendError>;

    /// Cancel a job; returns the state the backend reported before cancelling
    async fn cancel(&self, project: &str, job_id: &str) -> Result<Option<String>, BackendError>;

    /// List jobs for a project
    async fn list_jobs(&self, project: &str) -> Result<JobListing, BackendError>;
}

/// Clients keyed by node id (ordered, so iteration is deterministic)
pub type BackendClients = BTreeMap<String, Arc<dyn BackendClient>>;

/// Build HTTP clients for every configured backend
pub fn build_clients(config: &GatewayConfig) -> Result<BackendClients, BackendError> {
    let mut clients = BackendClients::new();
    for backend in &config.backends {
        let client = HttpBackendClient::new(backend, config.retry.clone())?
            .with_probe_timeout(config.probe.probe_timeout());
        clients.insert(backend.id.clone(), Arc::new(client) as Arc<dyn BackendClient>);
    }
    Ok(clients)
}

/// Backend errors
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("Backend {node} unreachable: {message}")]
    Unreachable { node: String, message: String },

    #[error("Backend {node} timed out")]
    Timeout { node: String },

    #[error("Backend {node} returned HTTP {status}: {message}")]
    Http {
        node: String,
        status: u16,
        message: String,
    },

    #[error("Backend {node} rejected the request: {message}")]
    Rejected { node: String, message: String },

    #[error("Backend {node} sent an invalid response: {message}")]
    InvalidResponse { node: String, message: String },

    #[error("Failed to initialise backend client: {0}")]
    Init(String),
}

impl BackendError {
    /// Worth retrying against the same node
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable { .. } | Self::Timeout { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Node the error came from, if any
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Unreachable { node, .. }
            | Self::Timeout { node }
            | Self::Http { node, .. }
            | Self::Rejected { node, .. }
            | Self::InvalidResponse { node, .. } => Some(node),
            Self::Init(_) => None,
        }
    }

    pub(crate) fn from_reqwest(node: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                node: node.to_string(),
            }
        } else if err.is_decode() {
            Self::InvalidResponse {
                node: node.to_string(),
                message: err.to_string(),
            }
        } else {
            Self::Unreachable {
                node: node.to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl ClassifiedError for BackendError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unreachable { .. } | Self::Timeout { .. } | Self::InvalidResponse { .. } => {
                ErrorKind::BackendUnreachable
            }
            Self::Http { status, .. } if *status >= 500 => ErrorKind::BackendUnreachable,
            Self::Http { .. } | Self::Rejected { .. } => ErrorKind::BackendRejected,
            Self::Init(_) => ErrorKind::Internal,
        }
    }
}
