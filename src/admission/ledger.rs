//! Resource ledger abstraction
//!
//! The ledger is the only state shared between gateway replicas. Every
//! method is a single atomic operation against the backing store, and every
//! operation that can free a slot also hands it to the head of the wait queue
//! in the same step, so a newcomer can never overtake a queued job.
//!
//! Slot accounting counts every stored lease, including expired ones the
//! sweep has not reclaimed yet. Capacity lost to a dead holder is therefore
//! bounded by one TTL plus one sweep interval, and the number of live leases
//! can never exceed the cap.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::LedgerError;

/// Cap and lifetime applied to every ledger operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    /// Maximum number of leases (`M`)
    pub max: u32,
    /// Lease lifetime without renewal
    pub ttl_ms: u64,
}

impl LeasePolicy {
    pub fn new(max: u32, ttl_ms: u64) -> Self {
        Self { max, ttl_ms }
    }
}

/// A time-bounded grant of one browser session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: String,
    /// Job id holding the lease
    pub holder: String,
    pub acquired_at_ms: i64,
    pub ttl_ms: u64,
    pub renewed_at_ms: i64,
}

impl Lease {
    pub fn expires_at_ms(&self) -> i64 {
        self.renewed_at_ms.saturating_add(self.ttl_ms as i64)
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at_ms() <= now_ms
    }
}

/// A job waiting for a lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitQueueEntry {
    pub job_id: String,
    pub enqueued_at_ms: i64,
}

/// Result of asking the ledger for a lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The holder owns this lease
    Granted(Lease),
    /// The holder waits at this 1-based queue position
    Queued { position: usize },
    /// The holder neither owns a lease nor waits (only returned by `poll`)
    NotQueued,
}

impl AcquireOutcome {
    pub fn lease(&self) -> Option<&Lease> {
        match self {
            Self::Granted(lease) => Some(lease),
            _ => None,
        }
    }
}

/// Result of a release
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// False when the lease was already gone
    pub released: bool,
    /// Holders that were handed the freed slot(s)
    pub granted: Vec<String>,
}

/// A lease reclaimed by the sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredLease {
    pub lease_id: String,
    pub holder: String,
}

/// Result of an expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub expired: Vec<ExpiredLease>,
    pub granted: Vec<String>,
}

/// Point-in-time view of the ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerStatus {
    /// Ledger clock at the time of the read
    pub now_ms: i64,
    pub leases: Vec<Lease>,
    pub queue: Vec<WaitQueueEntry>,
}

impl LedgerStatus {
    /// Leases that have not expired yet
    pub fn live_leases(&self) -> usize {
        self.leases
            .iter()
            .filter(|l| !l.is_expired_at(self.now_ms))
            .count()
    }
}

/// Shared lease counter and FIFO wait queue
#[async_trait]
pub trait ResourceLedger: Send + Sync {
    /// Backend name for logs and `/status`
    fn name(&self) -> &'static str;

    /// Grant a lease when a slot is free and nobody is queued ahead of the
    /// holder; otherwise enqueue the holder (at most once). A holder that
    /// already owns a lease gets it back, renewed.
    async fn acquire(&self, holder: &str, policy: LeasePolicy) -> Result<AcquireOutcome, LedgerError>;

    /// Check a waiting holder without enqueueing it
    async fn poll(&self, holder: &str, policy: LeasePolicy) -> Result<AcquireOutcome, LedgerError>;

    /// Release a lease (idempotent) and hand the slot to the queue head
    async fn release(&self, lease_id: &str, policy: LeasePolicy) -> Result<ReleaseOutcome, LedgerError>;

    /// Extend a live lease; `None` when it is gone or already expired
    async fn renew(&self, lease_id: &str, ttl_ms: u64) -> Result<Option<Lease>, LedgerError>;

    /// Leave the wait queue. A lease granted to the holder in the meantime is
    /// returned so the caller can use or release it.
    async fn abandon(&self, holder: &str) -> Result<Option<Lease>, LedgerError>;

    /// Reclaim expired leases and hand freed slots to waiters
    async fn sweep(&self, policy: LeasePolicy) -> Result<SweepOutcome, LedgerError>;

    /// Read every lease and queue entry
    async fn status(&self) -> Result<LedgerStatus, LedgerError>;

    /// Drop every lease and queue entry
    async fn reset(&self) -> Result<(), LedgerError>;
}
