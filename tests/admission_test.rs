//! Integration tests for browser-session admission
//!
//! These tests verify:
//! - The lease cap holds under arbitrary acquire/release/abandon sequences
//! - Freed slots go to waiters strictly in arrival order
//! - Concurrent waiters on one controller
//! - The shared Redis ledger (only when CRAWLGATE_TEST_REDIS_URL is set)

use crawlgate::admission::{
    AcquireOutcome, AdmissionController, AdmissionError, LeasePolicy, MemoryLedger, RedisLedger,
    ResourceLedger,
};
use crawlgate::config::{AdmissionConfig, LedgerBackend, LedgerConfig};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Model-Based Ledger Tests
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Acquire(u8),
    Release(u8),
    Abandon(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..8).prop_map(Op::Acquire),
        2 => (0u8..8).prop_map(Op::Release),
        1 => (0u8..8).prop_map(Op::Abandon),
    ]
}

/// Replays operations against a ledger while tracking the expected FIFO order
async fn check_ledger(ledger: &dyn ResourceLedger, max: u32, ops: &[Op]) -> Result<(), TestCaseError> {
    let policy = LeasePolicy::new(max, 600_000);
    let mut held: HashMap<String, String> = HashMap::new();
    let mut queue: Vec<String> = Vec::new();

    for op in ops {
        match op {
            Op::Acquire(n) => {
                let holder = format!("job-{n}");
                let outcome = ledger.acquire(&holder, policy).await.expect("acquire");
                match outcome {
                    AcquireOutcome::Granted(lease) => {
                        prop_assert!(
                            held.contains_key(&holder) || queue.is_empty(),
                            "{holder} overtook queued jobs {queue:?}"
                        );
                        held.insert(holder, lease.lease_id);
                    }
                    AcquireOutcome::Queued { position } => {
                        prop_assert!(!held.contains_key(&holder));
                        if !queue.contains(&holder) {
                            queue.push(holder.clone());
                        }
                        let expected = queue.iter().position(|h| *h == holder).map(|i| i + 1);
                        prop_assert_eq!(Some(position), expected);
                    }
                    AcquireOutcome::NotQueued => prop_assert!(false, "acquire never returns NotQueued"),
                }
            }
            Op::Release(n) => {
                let holder = format!("job-{n}");
                let Some(lease_id) = held.remove(&holder) else {
                    let outcome = ledger.release("no-such-lease", policy).await.expect("release");
                    prop_assert!(!outcome.released);
                    prop_assert!(outcome.granted.is_empty());
                    continue;
                };
                let outcome = ledger.release(&lease_id, policy).await.expect("release");
                prop_assert!(outcome.released);

                // Hand-offs are a prefix of the queue, in order
                let granted = outcome.granted.len();
                prop_assert!(granted <= queue.len());
                prop_assert_eq!(&outcome.granted[..], &queue[..granted]);
                for holder in queue.drain(..granted) {
                    match ledger.poll(&holder, policy).await.expect("poll") {
                        AcquireOutcome::Granted(lease) => {
                            held.insert(holder, lease.lease_id);
                        }
                        other => prop_assert!(false, "{holder} was handed a slot but polled {other:?}"),
                    }
                }
            }
            Op::Abandon(n) => {
                let holder = format!("job-{n}");
                if held.contains_key(&holder) {
                    continue;
                }
                let lease = ledger.abandon(&holder).await.expect("abandon");
                prop_assert!(lease.is_none());
                queue.retain(|h| *h != holder);
            }
        }

        let status = ledger.status().await.expect("status");
        prop_assert!(status.leases.len() <= max as usize);
        prop_assert_eq!(status.leases.len(), held.len());
        let queued: Vec<String> = status.queue.into_iter().map(|e| e.job_id).collect();
        prop_assert_eq!(&queued, &queue);
        if held.len() < max as usize {
            prop_assert!(queue.is_empty(), "free slot while jobs wait");
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_memory_ledger_cap_and_fifo(max in 1u32..4, ops in prop::collection::vec(op_strategy(), 1..60)) {
        let ledger = MemoryLedger::new();
        tokio_test::block_on(check_ledger(&ledger, max, &ops))?;
    }
}

// ============================================================================
// Controller Tests
// ============================================================================

fn config(max: u32) -> AdmissionConfig {
    AdmissionConfig {
        max_concurrent_sessions: max,
        lease_ttl_ms: 60_000,
        sweep_interval_ms: 20,
        acquire_timeout_ms: 1_000,
        poll_interval_ms: 10,
        browser_task_types: Vec::new(),
    }
}

#[tokio::test]
async fn test_waiters_granted_in_arrival_order() {
    let controller = Arc::new(AdmissionController::new(Arc::new(MemoryLedger::new()), &config(1)));
    let first = controller.acquire("first", Duration::from_millis(100)).await.unwrap();

    let mut waiters = Vec::new();
    for name in ["w1", "w2", "w3"] {
        let controller = Arc::clone(&controller);
        waiters.push(tokio::spawn(async move {
            controller.acquire(name, Duration::from_secs(5)).await
        }));
        // Enqueue deterministically
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let mut order = Vec::new();
    let mut current = first;
    for waiter in waiters {
        controller.release(&current.lease_id).await.unwrap();
        current = waiter.await.unwrap().unwrap();
        order.push(current.holder.clone());
        assert_eq!(controller.status().await.unwrap().live_leases, 1);
    }
    assert_eq!(order, vec!["w1", "w2", "w3"]);
}

#[tokio::test]
async fn test_concurrent_acquire_never_exceeds_cap() {
    let controller = Arc::new(AdmissionController::new(Arc::new(MemoryLedger::new()), &config(3)));

    let tasks: Vec<_> = (0..12)
        .map(|i| {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                let lease = controller
                    .acquire(&format!("job-{i}"), Duration::from_secs(10))
                    .await
                    .unwrap();
                let live = controller.status().await.unwrap().live_leases;
                tokio::time::sleep(Duration::from_millis(5)).await;
                controller.release(&lease.lease_id).await.unwrap();
                live
            })
        })
        .collect();

    for task in tasks {
        assert!(task.await.unwrap() <= 3);
    }
    let status = controller.status().await.unwrap();
    assert_eq!(status.live_leases, 0);
    assert!(status.wait_queue.is_empty());
}

#[tokio::test]
async fn test_expired_lease_reclaimed_by_sweeper() {
    let mut short = config(1);
    short.lease_ttl_ms = 50;
    let controller = Arc::new(AdmissionController::new(Arc::new(MemoryLedger::new()), &short));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sweeper = Arc::clone(&controller).spawn_sweeper(shutdown_rx);

    let stale = controller.acquire("crashed", Duration::from_millis(100)).await.unwrap();
    let next = controller.acquire("next", Duration::from_secs(2)).await.unwrap();
    assert_eq!(next.holder, "next");

    // The reclaimed lease is gone; releasing it is a no-op
    assert!(!controller.release(&stale.lease_id).await.unwrap());
    assert!(controller.renew(&stale.lease_id).await.unwrap().is_none());

    shutdown_tx.send(true).unwrap();
    sweeper.await.unwrap();
}

#[tokio::test]
async fn test_renew_keeps_lease_alive() {
    let mut short = config(1);
    short.lease_ttl_ms = 80;
    let controller = AdmissionController::new(Arc::new(MemoryLedger::new()), &short);

    let lease = controller.acquire("long-job", Duration::from_millis(100)).await.unwrap();
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(controller.renew(&lease.lease_id).await.unwrap().is_some());
        controller.sweep().await.unwrap();
    }
    assert_eq!(controller.status().await.unwrap().live_leases, 1);
}

#[tokio::test]
async fn test_disabled_admission() {
    let controller = AdmissionController::new(Arc::new(MemoryLedger::new()), &config(0));
    let err = controller.acquire("job", Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, AdmissionError::Unavailable { max: 0 }));
}

// ============================================================================
// Redis Ledger Tests
// ============================================================================

fn redis_config() -> Option<LedgerConfig> {
    let url = std::env::var("CRAWLGATE_TEST_REDIS_URL").ok()?;
    Some(LedgerConfig {
        backend: LedgerBackend::Redis,
        redis_url: url,
        key_prefix: format!("crawlgate-test:{}", uuid::Uuid::new_v4().simple()),
        pool_size: 4,
        ..Default::default()
    })
}

#[tokio::test]
#[ignore = "requires CRAWLGATE_TEST_REDIS_URL"]
async fn test_redis_ledger_cap_and_fifo() {
    let Some(config) = redis_config() else {
        return;
    };
    let ledger = RedisLedger::connect(&config).await.unwrap();
    ledger.reset().await.unwrap();

    let ops = [
        Op::Acquire(0),
        Op::Acquire(1),
        Op::Acquire(2),
        Op::Acquire(3),
        Op::Acquire(2),
        Op::Release(0),
        Op::Abandon(3),
        Op::Release(1),
        Op::Acquire(4),
        Op::Release(2),
    ];
    check_ledger(&ledger, 2, &ops).await.unwrap();
    ledger.reset().await.unwrap();
}

#[tokio::test]
#[ignore = "requires CRAWLGATE_TEST_REDIS_URL"]
async fn test_redis_ledger_shared_between_replicas() {
    let Some(config) = redis_config() else {
        return;
    };
    let replica_a = AdmissionController::new(
        Arc::new(RedisLedger::connect(&config).await.unwrap()),
        &self::config(1),
    );
    let replica_b = AdmissionController::new(
        Arc::new(RedisLedger::connect(&config).await.unwrap()),
        &self::config(1),
    );

    let lease = replica_a.acquire("a", Duration::from_millis(200)).await.unwrap();
    let err = replica_b.acquire("b", Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, AdmissionError::Timeout { .. }));

    replica_a.release(&lease.lease_id).await.unwrap();
    let lease_b = replica_b.acquire("b", Duration::from_millis(500)).await.unwrap();
    assert_eq!(lease_b.holder, "b");
    replica_b.reset_all().await.unwrap();
}
