//! In-process ledger
//!
//! Serialises every operation behind one mutex. Suitable for tests and for a
//! single gateway replica; several replicas need the Redis ledger.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

use super::ledger::{
    AcquireOutcome, ExpiredLease, Lease, LeasePolicy, LedgerStatus, ReleaseOutcome,
    ResourceLedger, SweepOutcome, WaitQueueEntry,
};
use super::LedgerError;
use crate::utils::now_millis;

#[derive(Debug, Default)]
struct LedgerState {
    leases: HashMap<String, Lease>,
    /// holder -> lease id
    holders: HashMap<String, String>,
    queue: VecDeque<WaitQueueEntry>,
    seq: u64,
}

impl LedgerState {
    fn grant(&mut self, holder: &str, ttl_ms: u64, now: i64) -> Lease {
        self.seq += 1;
        let lease = Lease {
            lease_id: format!("lease-{}", self.seq),
            holder: holder.to_string(),
            acquired_at_ms: now,
            ttl_ms,
            renewed_at_ms: now,
        };
        self.holders.insert(holder.to_string(), lease.lease_id.clone());
        self.leases.insert(lease.lease_id.clone(), lease.clone());
        lease
    }

    fn position(&self, holder: &str) -> Option<usize> {
        self.queue.iter().position(|e| e.job_id == holder)
    }

    fn dequeue(&mut self, holder: &str) {
        self.queue.retain(|e| e.job_id != holder);
    }

    fn remove_lease(&mut self, lease_id: &str) -> Option<Lease> {
        let lease = self.leases.remove(lease_id)?;
        if self.holders.get(&lease.holder).map(String::as_str) == Some(lease_id) {
            self.holders.remove(&lease.holder);
        }
        Some(lease)
    }

    /// Hand free slots to queue heads, oldest first
    fn pump(&mut self, policy: LeasePolicy, now: i64) -> Vec<String> {
        let mut granted = Vec::new();
        while self.leases.len() < policy.max as usize {
            let Some(head) = self.queue.pop_front() else {
                break;
            };
            if !self.holders.contains_key(&head.job_id) {
                self.grant(&head.job_id, policy.ttl_ms, now);
                granted.push(head.job_id);
            }
        }
        granted
    }

    fn held_lease(&self, holder: &str) -> Option<Lease> {
        self.holders
            .get(holder)
            .and_then(|id| self.leases.get(id))
            .cloned()
    }
}

/// Mutex-serialised ledger
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceLedger for MemoryLedger {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn acquire(&self, holder: &str, policy: LeasePolicy) -> Result<AcquireOutcome, LedgerError> {
        let now = now_millis();
        let mut state = self.state.lock().await;
        state.pump(policy, now);

        if let Some(id) = state.holders.get(holder).cloned() {
            state.dequeue(holder);
            if let Some(lease) = state.leases.get_mut(&id) {
                lease.renewed_at_ms = now;
                lease.ttl_ms = policy.ttl_ms;
                return Ok(AcquireOutcome::Granted(lease.clone()));
            }
        }

        // After the pump a free slot implies an empty queue
        if state.leases.len() < policy.max as usize {
            let lease = state.grant(holder, policy.ttl_ms, now);
            return Ok(AcquireOutcome::Granted(lease));
        }

        let position = match state.position(holder) {
            Some(index) => index + 1,
            None => {
                state.queue.push_back(WaitQueueEntry {
                    job_id: holder.to_string(),
                    enqueued_at_ms: now,
                });
                state.queue.len()
            }
        };
        Ok(AcquireOutcome::Queued { position })
    }

    async fn poll(&self, holder: &str, policy: LeasePolicy) -> Result<AcquireOutcome, LedgerError> {
        let now = now_millis();
        let mut state = self.state.lock().await;
        state.pump(policy, now);

        if let Some(lease) = state.held_lease(holder) {
            return Ok(AcquireOutcome::Granted(lease));
        }
        Ok(match state.position(holder) {
            Some(index) => AcquireOutcome::Queued { position: index + 1 },
            None => AcquireOutcome::NotQueued,
        })
    }

    async fn release(&self, lease_id: &str, policy: LeasePolicy) -> Result<ReleaseOutcome, LedgerError> {
        let now = now_millis();
        let mut state = self.state.lock().await;
        let released = state.remove_lease(lease_id).is_some();
        let granted = state.pump(policy, now);
        Ok(ReleaseOutcome { released, granted })
    }

    async fn renew(&self, lease_id: &str, ttl_ms: u64) -> Result<Option<Lease>, LedgerError> {
        let now = now_millis();
        let mut state = self.state.lock().await;
        Ok(state.leases.get_mut(lease_id).and_then(|lease| {
            if lease.is_expired_at(now) {
                return None;
            }
            lease.renewed_at_ms = now;
            lease.ttl_ms = ttl_ms;
            Some(lease.clone())
        }))
    }

    async fn abandon(&self, holder: &str) -> Result<Option<Lease>, LedgerError> {
        let mut state = self.state.lock().await;
        state.dequeue(holder);
        Ok(state.held_lease(holder))
    }

    async fn sweep(&self, policy: LeasePolicy) -> Result<SweepOutcome, LedgerError> {
        let now = now_millis();
        let mut state = self.state.lock().await;

        let mut expired_ids: Vec<(i64, String)> = state
            .leases
            .values()
            .filter(|l| l.is_expired_at(now))
            .map(|l| (l.expires_at_ms(), l.lease_id.clone()))
            .collect();
        expired_ids.sort();

        let expired = expired_ids
            .into_iter()
            .filter_map(|(_, id)| state.remove_lease(&id))
            .map(|lease| ExpiredLease {
                lease_id: lease.lease_id,
                holder: lease.holder,
            })
            .collect();
        let granted = state.pump(policy, now);

        Ok(SweepOutcome { expired, granted })
    }

    async fn status(&self) -> Result<LedgerStatus, LedgerError> {
        let state = self.state.lock().await;
        let mut leases: Vec<Lease> = state.leases.values().cloned().collect();
        leases.sort_by(|a, b| {
            a.acquired_at_ms
                .cmp(&b.acquired_at_ms)
                .then_with(|| a.lease_id.cmp(&b.lease_id))
        });

        Ok(LedgerStatus {
            now_ms: now_millis(),
            leases,
            queue: state.queue.iter().cloned().collect(),
        })
    }

    async fn reset(&self) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.leases.clear();
        state.holders.clear();
        state.queue.clear();
        Ok(())
    }
}
