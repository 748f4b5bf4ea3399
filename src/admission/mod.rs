//! Browser-session admission control
//!
//! Enforces the global cap on concurrently held browser sessions across all
//! backends and all gateway replicas:
//!
//! - [`ResourceLedger`] - atomic lease counter plus FIFO wait queue
//!   ([`MemoryLedger`] in process, [`RedisLedger`] shared)
//! - [`AdmissionController`] - blocking and non-blocking acquire, release,
//!   renewal, cancellation and the TTL sweep

pub mod controller;
pub mod ledger;
pub mod memory;
pub mod redis_ledger;

use std::sync::Arc;
use thiserror::Error;

use crate::config::{LedgerBackend, LedgerConfig};
use crate::error::{ClassifiedError, ErrorKind};

pub use controller::{AdmissionController, AdmissionStatus};
pub use ledger::{
    AcquireOutcome, ExpiredLease, Lease, LeasePolicy, LedgerStatus, ReleaseOutcome,
    ResourceLedger, SweepOutcome, WaitQueueEntry,
};
pub use memory::MemoryLedger;
pub use redis_ledger::RedisLedger;

/// Build the ledger selected in configuration
pub async fn build_ledger(config: &LedgerConfig) -> Result<Arc<dyn ResourceLedger>, LedgerError> {
    match config.backend {
        LedgerBackend::Memory => Ok(Arc::new(MemoryLedger::new())),
        LedgerBackend::Redis => Ok(Arc::new(RedisLedger::connect(config).await?)),
    }
}

/// Ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Unexpected ledger reply: {0}")]
    Protocol(String),
}

impl ClassifiedError for LedgerError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Ledger
    }
}

/// Admission errors
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Browser sessions are disabled (max_concurrent_sessions = {max})")]
    Unavailable { max: u32 },

    #[error("No browser session for job {job_id} after {waited_ms}ms")]
    Timeout { job_id: String, waited_ms: u64 },

    #[error("Job {job_id} was removed from the wait queue")]
    Dequeued { job_id: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ClassifiedError for AdmissionError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::Dequeued { .. } => {
                ErrorKind::ResourceUnavailable
            }
            Self::Ledger(e) => e.kind(),
        }
    }
}
