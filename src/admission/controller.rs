//! Admission controller
//!
//! Wraps a [`ResourceLedger`] with the caller-facing contract: blocking
//! `acquire` with a timeout, non-blocking `try_acquire`/`poll`, idempotent
//! release, renewal, cancellation of waiting jobs and the periodic TTL sweep.
//!
//! Waiters on this replica are woken through a [`Notify`] whenever a slot may
//! have been handed off; grants made by other replicas are picked up by
//! polling the ledger every `poll_interval`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ledger::{AcquireOutcome, Lease, LeasePolicy, LedgerStatus, ResourceLedger, SweepOutcome, WaitQueueEntry};
use super::{AdmissionError, LedgerError};
use crate::config::AdmissionConfig;
use crate::error::ErrorKind;
use crate::metrics;

/// Gates access to the bounded browser-session resource
pub struct AdmissionController {
    ledger: Arc<dyn ResourceLedger>,
    policy: LeasePolicy,
    poll_interval: Duration,
    sweep_interval: Duration,
    notify: Notify,
}

impl AdmissionController {
    /// Create a controller
    pub fn new(ledger: Arc<dyn ResourceLedger>, config: &AdmissionConfig) -> Self {
        Self {
            ledger,
            policy: LeasePolicy::new(config.max_concurrent_sessions, config.lease_ttl_ms),
            poll_interval: config.poll_interval(),
            sweep_interval: config.sweep_interval(),
            notify: Notify::new(),
        }
    }

    pub fn policy(&self) -> LeasePolicy {
        self.policy
    }

    pub fn ledger_name(&self) -> &'static str {
        self.ledger.name()
    }

    fn check_enabled(&self) -> Result<(), AdmissionError> {
        if self.policy.max == 0 {
            return Err(AdmissionError::Unavailable { max: 0 });
        }
        Ok(())
    }

    /// Wait up to `timeout` for a lease
    ///
    /// Granted immediately when a slot is free and nobody is queued; otherwise
    /// the job joins the FIFO queue once and waits. On timeout the queue entry
    /// is removed; a lease that was granted in the meantime is returned
    /// instead of being leaked.
    pub async fn acquire(&self, job_id: &str, timeout: Duration) -> Result<Lease, AdmissionError> {
        self.check_enabled()?;
        let started = Instant::now();
        let deadline = started + timeout;

        match self.ledger.acquire(job_id, self.policy).await? {
            AcquireOutcome::Granted(lease) => {
                debug!(job_id, lease_id = %lease.lease_id, "Lease granted");
                metrics::record_acquire_wait("granted", 0.0);
                return Ok(lease);
            }
            AcquireOutcome::Queued { position } => {
                info!(job_id, position, "Browser sessions saturated, job queued");
            }
            AcquireOutcome::NotQueued => {
                return Err(AdmissionError::Dequeued {
                    job_id: job_id.to_string(),
                });
            }
        }

        loop {
            // Register before polling so a hand-off between the poll and the
            // wait is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.ledger.poll(job_id, self.policy).await {
                Ok(AcquireOutcome::Granted(lease)) => {
                    let waited = started.elapsed();
                    debug!(job_id, lease_id = %lease.lease_id, waited_ms = waited.as_millis() as u64, "Lease granted after wait");
                    metrics::record_acquire_wait("granted", waited.as_secs_f64());
                    return Ok(lease);
                }
                Ok(AcquireOutcome::Queued { .. }) => {}
                Ok(AcquireOutcome::NotQueued) => {
                    metrics::record_acquire_wait("dequeued", started.elapsed().as_secs_f64());
                    return Err(AdmissionError::Dequeued {
                        job_id: job_id.to_string(),
                    });
                }
                Err(e) => {
                    warn!(job_id, error = %e, "Ledger poll failed while waiting");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let waited_ms = started.elapsed().as_millis() as u64;
        if let Some(lease) = self.ledger.abandon(job_id).await? {
            debug!(job_id, lease_id = %lease.lease_id, "Lease granted while timing out");
            metrics::record_acquire_wait("granted", started.elapsed().as_secs_f64());
            return Ok(lease);
        }

        metrics::record_acquire_wait("timeout", started.elapsed().as_secs_f64());
        warn!(job_id, waited_ms, "Timed out waiting for a browser session");
        Err(AdmissionError::Timeout {
            job_id: job_id.to_string(),
            waited_ms,
        })
    }

    /// Non-blocking acquire: a lease or a queue position
    pub async fn try_acquire(&self, job_id: &str) -> Result<AcquireOutcome, AdmissionError> {
        self.check_enabled()?;
        Ok(self.ledger.acquire(job_id, self.policy).await?)
    }

    /// Check on a job previously queued by `try_acquire`
    pub async fn poll(&self, job_id: &str) -> Result<AcquireOutcome, AdmissionError> {
        self.check_enabled()?;
        Ok(self.ledger.poll(job_id, self.policy).await?)
    }

    /// Release a lease; releasing an unknown or expired lease is a no-op
    pub async fn release(&self, lease_id: &str) -> Result<bool, AdmissionError> {
        let outcome = self.ledger.release(lease_id, self.policy).await?;
        if outcome.released {
            debug!(lease_id, "Lease released");
        } else {
            debug!(lease_id, "Release of unknown lease ignored");
        }
        self.announce_grants(&outcome.granted);
        Ok(outcome.released)
    }

    /// Extend a live lease
    pub async fn renew(&self, lease_id: &str) -> Result<Option<Lease>, AdmissionError> {
        Ok(self.ledger.renew(lease_id, self.policy.ttl_ms).await?)
    }

    /// Remove a job from the wait queue and release any lease it holds
    ///
    /// Returns the released lease, if any.
    pub async fn cancel_waiting(&self, job_id: &str) -> Result<Option<Lease>, AdmissionError> {
        let held = self.ledger.abandon(job_id).await?;
        if let Some(lease) = &held {
            let outcome = self.ledger.release(&lease.lease_id, self.policy).await?;
            self.announce_grants(&outcome.granted);
        }
        // Wake this replica's waiter for the job so it observes the removal
        self.notify.notify_waiters();
        debug!(job_id, released = held.is_some(), "Job removed from admission");
        Ok(held)
    }

    /// Reclaim expired leases and hand the slots to waiters
    pub async fn sweep(&self) -> Result<SweepOutcome, AdmissionError> {
        let outcome = self.ledger.sweep(self.policy).await?;
        for expired in &outcome.expired {
            warn!(
                lease_id = %expired.lease_id,
                holder = %expired.holder,
                kind = %ErrorKind::LeaseExpired,
                "Lease expired without renewal, slot reclaimed"
            );
        }
        metrics::record_lease_expirations(outcome.expired.len());
        self.announce_grants(&outcome.granted);
        Ok(outcome)
    }

    /// Run the sweep every `sweep_interval` until shutdown
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "Lease sweep failed");
                        }
                        if let Err(e) = self.status().await {
                            debug!(error = %e, "Admission status refresh failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Lease sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Aggregate view of leases and the wait queue
    pub async fn status(&self) -> Result<AdmissionStatus, LedgerError> {
        let status: LedgerStatus = self.ledger.status().await?;
        let live = status.live_leases();
        metrics::update_admission_metrics(live, status.queue.len());

        Ok(AdmissionStatus {
            ledger: self.ledger.name().to_string(),
            max_concurrent_sessions: self.policy.max,
            lease_ttl_ms: self.policy.ttl_ms,
            live_leases: live,
            available: (self.policy.max as usize).saturating_sub(status.leases.len()),
            leases: status.leases,
            wait_queue: status.queue,
        })
    }

    /// Forcibly clear every lease and the wait queue
    ///
    /// Operator recovery only: jobs holding leases keep running without being
    /// counted, so the cap can be exceeded until they finish.
    pub async fn reset_all(&self) -> Result<(), AdmissionError> {
        warn!("Resetting admission ledger: all leases and queued jobs dropped");
        self.ledger.reset().await?;
        self.notify.notify_waiters();
        metrics::update_admission_metrics(0, 0);
        Ok(())
    }

    fn announce_grants(&self, granted: &[String]) {
        if granted.is_empty() {
            return;
        }
        debug!(holders = ?granted, "Freed slots handed to queued jobs");
        self.notify.notify_waiters();
    }
}

/// Admission view for `/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionStatus {
    pub ledger: String,
    pub max_concurrent_sessions: u32,
    pub lease_ttl_ms: u64,
    pub live_leases: usize,
    pub available: usize,
    pub leases: Vec<Lease>,
    pub wait_queue: Vec<WaitQueueEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::MemoryLedger;

    fn controller(max: u32) -> Arc<AdmissionController> {
        let config = AdmissionConfig {
            max_concurrent_sessions: max,
            lease_ttl_ms: 60_000,
            sweep_interval_ms: 50,
            acquire_timeout_ms: 1_000,
            poll_interval_ms: 20,
            browser_task_types: Vec::new(),
        };
        Arc::new(AdmissionController::new(Arc::new(MemoryLedger::new()), &config))
    }

    #[tokio::test]
    async fn test_zero_capacity_fails_fast() {
        let controller = controller(0);
        let started = Instant::now();

        let err = controller
            .acquire("job", Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(err, AdmissionError::Unavailable { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(controller.try_acquire("job").await.is_err());
    }

    #[tokio::test]
    async fn test_waiter_gets_released_slot() {
        let controller = controller(1);
        let first = controller.acquire("a", Duration::from_millis(100)).await.unwrap();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.acquire("b", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(controller.release(&first.lease_id).await.unwrap());

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.holder, "b");
    }

    #[tokio::test]
    async fn test_timeout_removes_queue_entry() {
        let controller = controller(1);
        controller.acquire("a", Duration::from_millis(100)).await.unwrap();

        let err = controller
            .acquire("b", Duration::from_millis(60))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Timeout { .. }));

        let status = controller.status().await.unwrap();
        assert!(status.wait_queue.is_empty());
        assert_eq!(status.live_leases, 1);
    }

    #[tokio::test]
    async fn test_cancel_waiting_wakes_waiter() {
        let controller = controller(1);
        controller.acquire("a", Duration::from_millis(100)).await.unwrap();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.acquire("b", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(controller.cancel_waiting("b").await.unwrap().is_none());

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, AdmissionError::Dequeued { .. }));
    }

    #[tokio::test]
    async fn test_try_acquire_then_poll() {
        let controller = controller(1);
        let lease = match controller.try_acquire("a").await.unwrap() {
            AcquireOutcome::Granted(lease) => lease,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(
            controller.try_acquire("b").await.unwrap(),
            AcquireOutcome::Queued { position: 1 }
        );

        controller.release(&lease.lease_id).await.unwrap();
        assert!(controller.poll("b").await.unwrap().lease().is_some());
    }

    #[tokio::test]
    async fn test_release_twice_is_noop() {
        let controller = controller(2);
        let lease = controller.acquire("a", Duration::from_millis(100)).await.unwrap();
        assert!(controller.release(&lease.lease_id).await.unwrap());
        assert!(!controller.release(&lease.lease_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_all() {
        let controller = controller(1);
        controller.acquire("a", Duration::from_millis(100)).await.unwrap();
        controller.try_acquire("b").await.unwrap();

        controller.reset_all().await.unwrap();
        let status = controller.status().await.unwrap();
        assert_eq!(status.live_leases, 0);
        assert!(status.wait_queue.is_empty());
        assert_eq!(status.available, 1);
    }
}
