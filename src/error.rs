//! Unified error handling for the crawlgate crate
//!
//! Each subsystem owns a domain-specific error enum. This module ties them
//! together with a stable [`ErrorKind`] taxonomy so that every rejection that
//! reaches a caller (HTTP client or queue producer) carries the same
//! machine-readable code regardless of where it originated.
//!
//! # Architecture
//!
//! - [`ClassifiedError`] - Common interface implemented by all error types
//! - [`ErrorKind`] - Stable, caller-visible classification
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use crawlgate::error::{ClassifiedError, Error};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         println!("retry later: {} ({})", err, err.kind());
//!     } else {
//!         eprintln!("fatal: {}", err);
//!     }
//! }
//! ```

use std::fmt;
use thiserror::Error;

pub use crate::admission::{AdmissionError, LedgerError};
pub use crate::backend::BackendError;
pub use crate::browser::SessionError;
pub use crate::config::ConfigError;
pub use crate::intake::IntakeError;
pub use crate::rotation::RotationError;
pub use crate::scheduler::SchedulerError;

/// Common trait for all crawlgate error types
pub trait ClassifiedError: std::error::Error {
    /// Stable kind surfaced to callers
    fn kind(&self) -> ErrorKind;

    /// Check if this error is transient (the same request may succeed later)
    fn is_recoverable(&self) -> bool {
        self.kind().is_transient()
    }
}

/// Stable error classification
///
/// The string form returned by [`ErrorKind::as_str`] is part of the public
/// API contract and must not change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No online backend can accept the job
    NoCapacity,
    /// The bounded browser-session resource could not be granted in time
    ResourceUnavailable,
    /// Network failure talking to a backend or the browser cluster
    BackendUnreachable,
    /// The backend answered but refused the job
    BackendRejected,
    /// Idempotency key collision (treated as success by callers)
    DuplicateTask,
    /// A lease was reclaimed by the TTL sweep (never surfaced to callers)
    LeaseExpired,
    /// Requested job or node does not exist
    NotFound,
    /// Malformed or semantically invalid request
    InvalidRequest,
    /// The job was cancelled before it could be dispatched
    Cancelled,
    /// Resource ledger failure
    Ledger,
    /// Message broker failure
    Broker,
    /// Configuration error
    Config,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// Get the stable snake_case code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoCapacity => "no_capacity",
            Self::ResourceUnavailable => "resource_unavailable",
            Self::BackendUnreachable => "backend_unreachable",
            Self::BackendRejected => "backend_rejected",
            Self::DuplicateTask => "duplicate_task",
            Self::LeaseExpired => "lease_expired",
            Self::NotFound => "not_found",
            Self::InvalidRequest => "invalid_request",
            Self::Cancelled => "cancelled",
            Self::Ledger => "ledger",
            Self::Broker => "broker",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }

    /// Whether a caller may reasonably resubmit the same request later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoCapacity
                | Self::ResourceUnavailable
                | Self::BackendUnreachable
                | Self::Ledger
                | Self::Broker
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the crawlgate crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Browser session error: {0}")]
    Session(#[from] SessionError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Rotation error: {0}")]
    Rotation(#[from] RotationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ClassifiedError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Scheduler(e) => e.kind(),
            Self::Admission(e) => e.kind(),
            Self::Ledger(e) => e.kind(),
            Self::Backend(e) => e.kind(),
            Self::Session(e) => e.kind(),
            Self::Intake(e) => e.kind(),
            Self::Rotation(e) => e.kind(),
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Result type alias using the unified Error
pub type Result<T> = std::result::Result<T, Error>;
