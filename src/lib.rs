//! crawlgate - Distributed crawl scheduling gateway
//!
//! Sits between task producers (HTTP clients, a Redis-backed queue) and a
//! pool of Scrapyd-compatible worker backends. Picks the least-loaded
//! backend, bounds concurrent browser-automation sessions across every
//! gateway replica, and rotates egress proxies and client identities.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading, env overrides and validation
//! - [`models`] - Job requests, jobs and backend payloads
//! - [`backend`] - Worker backend protocol client
//! - [`registry`] - Backend registry and health prober
//! - [`admission`] - Browser-session leases and the FIFO wait queue
//! - [`browser`] - Remote WebDriver sessions
//! - [`rotation`] - Proxy and identity rotation
//! - [`scheduler`] - Job placement, cancellation and status tracking
//! - [`intake`] - Queue consumers
//! - [`gateway`] - HTTP API
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use crawlgate::config::GatewayConfig;
//! use crawlgate::gateway::GatewayServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::from_env()?;
//!     let server = GatewayServer::new(config).await?;
//!     server.start_with_shutdown(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod backend;
pub mod browser;
pub mod config;
pub mod error;
pub mod gateway;
pub mod intake;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod rotation;
pub mod scheduler;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::admission::{AdmissionController, Lease, MemoryLedger, RedisLedger, ResourceLedger};
    pub use crate::config::GatewayConfig;
    pub use crate::error::{ClassifiedError, Error, ErrorKind, Result};
    pub use crate::gateway::GatewayServer;
    pub use crate::models::{Job, JobRequest, JobState};
    pub use crate::scheduler::{ScheduleResponse, Scheduler};
}

// Direct re-exports for convenience
pub use error::{ClassifiedError, Error, ErrorKind, Result};
pub use models::{Job, JobRequest, JobState};
