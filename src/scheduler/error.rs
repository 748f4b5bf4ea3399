//! Error types for the scheduler module

use thiserror::Error;

use crate::admission::{AdmissionError, LedgerError};
use crate::browser::SessionError;
use crate::error::{ClassifiedError, ErrorKind};

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// No backend is online
    #[error("No online backend can accept the job")]
    NoCapacity,

    /// Browser-session lease not granted
    #[error("Browser session unavailable for job '{job_id}': {reason}")]
    ResourceUnavailable { job_id: String, reason: String },

    /// Every candidate failed with a transient error
    #[error("No backend reachable for job '{job_id}': {attempts}")]
    BackendUnreachable { job_id: String, attempts: String },

    /// A backend answered but refused the job
    #[error("Backend {node} rejected job '{job_id}': {message}")]
    BackendRejected {
        job_id: String,
        node: String,
        message: String,
    },

    /// Another placement of the same job id holds the dispatch claim
    ///
    /// Transient: the claim is either committed or expires.
    #[error("Job '{job_id}' is already being dispatched")]
    InFlight { job_id: String },

    /// Job was cancelled before it reached a backend
    #[error("Job '{job_id}' was cancelled")]
    Cancelled { job_id: String },

    #[error("Job '{job_id}' not found")]
    NotFound { job_id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Browser session error: {0}")]
    Session(#[from] SessionError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl SchedulerError {
    /// Create a resource unavailable error
    pub fn unavailable(job_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResourceUnavailable {
            job_id: job_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(job_id: impl Into<String>) -> Self {
        Self::NotFound {
            job_id: job_id.into(),
        }
    }

    /// Create a cancelled error
    pub fn cancelled(job_id: impl Into<String>) -> Self {
        Self::Cancelled {
            job_id: job_id.into(),
        }
    }

    /// Map an admission failure for `job_id`
    ///
    /// A dequeued waiter is reported as unavailable here; the scheduler
    /// upgrades it to `Cancelled` when the job table says so.
    pub fn from_admission(job_id: &str, err: AdmissionError) -> Self {
        match err {
            AdmissionError::Ledger(e) => Self::Ledger(e),
            other => Self::unavailable(job_id, other.to_string()),
        }
    }
}

impl ClassifiedError for SchedulerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NoCapacity => ErrorKind::NoCapacity,
            Self::ResourceUnavailable { .. } | Self::InFlight { .. } => ErrorKind::ResourceUnavailable,
            Self::BackendUnreachable { .. } => ErrorKind::BackendUnreachable,
            Self::BackendRejected { .. } => ErrorKind::BackendRejected,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Session(e) => e.kind(),
            Self::Ledger(e) => e.kind(),
        }
    }
}
