//! Integration tests for job placement
//!
//! These tests verify the complete workflow of:
//! - Least-loaded dispatch and failover
//! - Idempotent resubmission
//! - Browser-session leases across dispatch, failure and cancellation
//! - Status reconciliation

mod common;

use common::{
    accept_cancel, accept_schedule, admission_config, fail_schedule, mock_backend, mount_listing,
    reject_schedule, submitted_forms, Harness,
};
use crawlgate::error::{ClassifiedError, ErrorKind};
use crawlgate::registry::NodeStatus;
use crawlgate::scheduler::{
    DispatchLog, JobTracker, MemoryDispatchLog, ScheduleStatus, SchedulerError,
};
use crawlgate::{JobRequest, JobState};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

// ============================================================================
// Placement Tests
// ============================================================================

#[tokio::test]
async fn test_dispatch_to_least_loaded_node() {
    let n1 = mock_backend(3, 0).await;
    let n2 = mock_backend(1, 0).await;
    let n3 = mock_backend(4, 1).await;
    for server in [&n1, &n2, &n3] {
        accept_schedule(server).await;
    }
    let harness = Harness::probed(&[("n1", &n1), ("n2", &n2), ("n3", &n3)], admission_config(2)).await;

    let response = harness
        .scheduler
        .schedule(
            JobRequest::new("demo", "quotes")
                .with_job_id("job-1")
                .with_setting("DOWNLOAD_DELAY", "2")
                .with_arg("page", "1"),
        )
        .await
        .unwrap();

    assert_eq!(response.status, ScheduleStatus::Dispatched);
    assert_eq!(response.state, JobState::Dispatched);
    assert_eq!(response.node.as_deref(), Some("n2"));
    assert!(response.lease_id.is_none());

    let forms = submitted_forms(&n2).await;
    assert_eq!(forms.len(), 1);
    assert!(forms[0].contains("jobid=job-1"));
    assert!(forms[0].contains("setting=DOWNLOAD_DELAY%3D2"));
    assert!(forms[0].contains("page=1"));
    assert!(submitted_forms(&n1).await.is_empty());
}

#[tokio::test]
async fn test_dispatch_bumps_pending_so_next_job_spreads() {
    let a = mock_backend(0, 0).await;
    let b = mock_backend(0, 0).await;
    accept_schedule(&a).await;
    accept_schedule(&b).await;
    let harness = Harness::probed(&[("a", &a), ("b", &b)], admission_config(2)).await;

    let first = harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes"))
        .await
        .unwrap();
    let second = harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes"))
        .await
        .unwrap();

    assert_eq!(first.node.as_deref(), Some("a"));
    assert_eq!(second.node.as_deref(), Some("b"));
    assert_ne!(first.job_id, second.job_id);
}

#[tokio::test]
async fn test_absurd_reported_load_saturates() {
    let busy = mock_backend(u32::MAX, 5).await;
    let idle = mock_backend(1, 0).await;
    accept_schedule(&idle).await;
    let harness = Harness::probed(&[("busy", &busy), ("idle", &idle)], admission_config(1)).await;

    let busy_node = harness.registry.get("busy").await.unwrap();
    assert_eq!(busy_node.status, NodeStatus::Online);
    assert_eq!(busy_node.load(), u32::MAX);

    let response = harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes"))
        .await
        .unwrap();
    assert_eq!(response.node.as_deref(), Some("idle"));
}

#[tokio::test]
async fn test_failover_marks_node_offline() {
    let flaky = mock_backend(0, 0).await;
    let healthy = mock_backend(5, 0).await;
    fail_schedule(&flaky, 503).await;
    accept_schedule(&healthy).await;
    let harness = Harness::probed(&[("flaky", &flaky), ("healthy", &healthy)], admission_config(2)).await;

    let response = harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes").with_job_id("job-f"))
        .await
        .unwrap();

    assert_eq!(response.node.as_deref(), Some("healthy"));
    let node = harness.registry.get("flaky").await.unwrap();
    assert_eq!(node.status, NodeStatus::Offline);
    // First attempt plus one retry
    assert_eq!(submitted_forms(&flaky).await.len(), 2);
}

#[tokio::test]
async fn test_all_nodes_unreachable() {
    let only = mock_backend(0, 0).await;
    fail_schedule(&only, 502).await;
    let harness = Harness::probed(&[("only", &only)], admission_config(2)).await;

    let err = harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes").with_job_id("job-u"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BackendUnreachable);
    let job = harness.scheduler.job("job-u").await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.is_some());
}

#[tokio::test]
async fn test_no_capacity_before_first_probe() {
    let node = mock_backend(0, 0).await;
    accept_schedule(&node).await;
    let harness = Harness::new(&[("n1", &node)], admission_config(2));

    let err = harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes").with_job_id("job-n"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NoCapacity));
    assert!(submitted_forms(&node).await.is_empty());

    // A job that never reached a backend may be resubmitted
    harness.prober.probe_all().await;
    let response = harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes").with_job_id("job-n"))
        .await
        .unwrap();
    assert_eq!(response.status, ScheduleStatus::Dispatched);
}

#[tokio::test]
async fn test_backend_rejection_is_not_failed_over() {
    let strict = mock_backend(0, 0).await;
    let other = mock_backend(9, 0).await;
    reject_schedule(&strict, "spider 'nope' not found").await;
    accept_schedule(&other).await;
    let harness = Harness::probed(&[("strict", &strict), ("other", &other)], admission_config(2)).await;

    let err = harness
        .scheduler
        .schedule(JobRequest::new("demo", "nope"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BackendRejected);
    assert!(err.to_string().contains("not found"));
    assert!(submitted_forms(&other).await.is_empty());
    assert_eq!(
        harness.registry.get("strict").await.unwrap().status,
        NodeStatus::Online
    );
}

#[tokio::test]
async fn test_invalid_request() {
    let node = mock_backend(0, 0).await;
    let harness = Harness::probed(&[("n1", &node)], admission_config(2)).await;

    let err = harness
        .scheduler
        .schedule(JobRequest::new("", "quotes"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(harness.scheduler.jobs().is_empty().await);
}

// ============================================================================
// Idempotency Tests
// ============================================================================

#[tokio::test]
async fn test_duplicate_job_id_submits_once() {
    let node = mock_backend(0, 0).await;
    Mock::given(method("POST"))
        .and(path("/schedule.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok"})))
        .expect(1)
        .mount(&node)
        .await;
    let harness = Harness::probed(&[("n1", &node)], admission_config(2)).await;

    let request = JobRequest::new("demo", "quotes").with_job_id("task-42");
    let first = harness.scheduler.schedule(request.clone()).await.unwrap();
    let second = harness.scheduler.schedule(request).await.unwrap();

    assert_eq!(first.status, ScheduleStatus::Dispatched);
    assert_eq!(second.status, ScheduleStatus::Duplicate);
    assert_eq!(second.node.as_deref(), Some("n1"));
    assert_eq!(harness.scheduler.jobs().len().await, 1);
}

#[tokio::test]
async fn test_redelivery_after_restart_uses_dispatch_log() {
    let node = mock_backend(0, 0).await;
    accept_schedule(&node).await;
    let log: Arc<dyn DispatchLog> = Arc::new(MemoryDispatchLog::new());
    let request = JobRequest::new("demo", "quotes").with_job_id("task-42");

    let first = {
        let shared = Arc::clone(&log);
        let before = Harness::probed_with(&[("n1", &node)], admission_config(2), |s| {
            s.with_dispatch_log(shared, &Default::default())
        })
        .await;
        before.scheduler.schedule(request.clone()).await.unwrap()
    };
    assert_eq!(first.status, ScheduleStatus::Dispatched);

    // Fresh scheduler, empty job table, same dispatch log
    let shared = Arc::clone(&log);
    let after = Harness::probed_with(&[("n1", &node)], admission_config(2), |s| {
        s.with_dispatch_log(shared, &Default::default())
    })
    .await;
    let second = after.scheduler.schedule(request).await.unwrap();

    assert_eq!(second.status, ScheduleStatus::Duplicate);
    assert_eq!(second.node.as_deref(), Some("n1"));
    assert_eq!(submitted_forms(&node).await.len(), 1);

    let job = after.scheduler.job("task-42").await.unwrap();
    assert_eq!(job.state, JobState::Dispatched);
    assert_eq!(job.assigned_backend.as_deref(), Some("n1"));
}

#[tokio::test]
async fn test_redelivery_after_restart_found_in_listing() {
    let node = mock_backend(0, 0).await;
    accept_schedule(&node).await;
    let request = JobRequest::new("demo", "quotes").with_job_id("task-43");

    let first = Harness::probed(&[("n1", &node)], admission_config(2)).await;
    first.scheduler.schedule(request.clone()).await.unwrap();
    drop(first);
    mount_listing(&node, &[], &["task-43"], &[]).await;

    let after =
        Harness::probed_with(&[("n1", &node)], admission_config(2), |s| s.with_remote_check(true)).await;
    let second = after.scheduler.schedule(request).await.unwrap();

    assert_eq!(second.status, ScheduleStatus::Duplicate);
    assert_eq!(second.state, JobState::Running);
    assert_eq!(submitted_forms(&node).await.len(), 1);

    // Generated ids are never looked up
    let fresh = after
        .scheduler
        .schedule(JobRequest::new("demo", "quotes"))
        .await
        .unwrap();
    assert_eq!(fresh.status, ScheduleStatus::Dispatched);
}

#[tokio::test]
async fn test_in_flight_claim_defers_job() {
    let node = mock_backend(0, 0).await;
    accept_schedule(&node).await;
    let log = Arc::new(MemoryDispatchLog::new());
    let shared: Arc<dyn DispatchLog> = log.clone();
    let harness = Harness::probed_with(&[("n1", &node)], admission_config(2), |s| {
        s.with_dispatch_log(shared, &Default::default())
    })
    .await;

    // Claimed by another gateway that has not finished placing it
    log.claim("task-44", Duration::from_secs(60)).await.unwrap();
    let request = JobRequest::new("demo", "quotes").with_job_id("task-44");

    let err = harness.scheduler.schedule(request.clone()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::InFlight { .. }));
    assert!(err.is_recoverable());
    assert!(submitted_forms(&node).await.is_empty());

    // The other placement gave up; a retry goes through
    log.forget("task-44").await.unwrap();
    let response = harness.scheduler.schedule(request).await.unwrap();
    assert_eq!(response.status, ScheduleStatus::Dispatched);
    assert_eq!(submitted_forms(&node).await.len(), 1);
}

// ============================================================================
// Admission Tests
// ============================================================================

#[tokio::test]
async fn test_browser_job_holds_lease_after_dispatch() {
    let node = mock_backend(0, 0).await;
    accept_schedule(&node).await;
    let harness = Harness::probed(&[("n1", &node)], admission_config(1)).await;

    let response = harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes").with_browser(true))
        .await
        .unwrap();
    assert!(response.lease_id.is_some());
    assert_eq!(harness.live_leases().await, 1);

    // Spiders listed as browser task types need a lease too
    let err = harness
        .scheduler
        .schedule(JobRequest::new("demo", "rendered"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert_eq!(harness.live_leases().await, 1);

    let status = harness.admission.status().await.unwrap();
    assert!(status.wait_queue.is_empty());
}

#[tokio::test]
async fn test_lease_released_when_dispatch_fails() {
    let node = mock_backend(0, 0).await;
    reject_schedule(&node, "bad spider").await;
    let harness = Harness::probed(&[("n1", &node)], admission_config(1)).await;

    let err = harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes").with_browser(true))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BackendRejected);
    assert_eq!(harness.live_leases().await, 0);
}

#[tokio::test]
async fn test_zero_sessions_rejects_browser_jobs_only() {
    let node = mock_backend(0, 0).await;
    accept_schedule(&node).await;
    let harness = Harness::probed(&[("n1", &node)], admission_config(0)).await;

    let err = harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes").with_browser(true))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);

    let plain = harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes"))
        .await
        .unwrap();
    assert_eq!(plain.status, ScheduleStatus::Dispatched);
}

#[tokio::test]
async fn test_queued_job_dispatches_when_slot_frees() {
    let node = mock_backend(0, 0).await;
    accept_schedule(&node).await;
    accept_cancel(&node, "running").await;
    let mut config = admission_config(1);
    config.acquire_timeout_ms = 5_000;
    let harness = Harness::probed(&[("n1", &node)], config).await;

    harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes").with_job_id("a").with_browser(true))
        .await
        .unwrap();

    let waiting = {
        let scheduler = Arc::clone(&harness.scheduler);
        tokio::spawn(async move {
            scheduler
                .schedule(JobRequest::new("demo", "quotes").with_job_id("b").with_browser(true))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.admission.status().await.unwrap().wait_queue.len(), 1);

    harness.scheduler.cancel("demo", "a").await.unwrap();

    let response = waiting.await.unwrap().unwrap();
    assert_eq!(response.job_id, "b");
    assert!(response.lease_id.is_some());
    assert_eq!(harness.live_leases().await, 1);
}

// ============================================================================
// Cancellation Tests
// ============================================================================

#[tokio::test]
async fn test_cancel_while_waiting_for_lease() {
    let node = mock_backend(0, 0).await;
    accept_schedule(&node).await;
    let mut config = admission_config(1);
    config.acquire_timeout_ms = 5_000;
    let harness = Harness::probed(&[("n1", &node)], config).await;

    harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes").with_job_id("holder").with_browser(true))
        .await
        .unwrap();

    let waiting = {
        let scheduler = Arc::clone(&harness.scheduler);
        tokio::spawn(async move {
            scheduler
                .schedule(JobRequest::new("demo", "quotes").with_job_id("queued").with_browser(true))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = harness.scheduler.cancel("demo", "queued").await.unwrap();
    assert!(outcome.cancelled);
    assert_eq!(outcome.previous_state, "pending");
    assert!(outcome.node.is_none());

    let err = waiting.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let status = harness.admission.status().await.unwrap();
    assert!(status.wait_queue.is_empty());
    assert_eq!(status.live_leases, 1);
    assert_eq!(submitted_forms(&node).await.len(), 1);
}

#[tokio::test]
async fn test_cancel_dispatched_job_releases_lease() {
    let node = mock_backend(0, 0).await;
    accept_schedule(&node).await;
    accept_cancel(&node, "running").await;
    let harness = Harness::probed(&[("n1", &node)], admission_config(1)).await;

    harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes").with_job_id("c-1").with_browser(true))
        .await
        .unwrap();
    assert_eq!(harness.live_leases().await, 1);

    let outcome = harness.scheduler.cancel("demo", "c-1").await.unwrap();
    assert!(outcome.cancelled);
    assert!(outcome.remote_confirmed);
    assert_eq!(outcome.node.as_deref(), Some("n1"));
    assert_eq!(outcome.previous_state, "dispatched");
    assert_eq!(harness.live_leases().await, 0);

    // Terminal jobs are left alone
    let again = harness.scheduler.cancel("demo", "c-1").await.unwrap();
    assert!(!again.cancelled);
    assert_eq!(again.state, "cancelled");
}

#[tokio::test]
async fn test_cancel_unconfirmed_when_backend_down() {
    let node = mock_backend(0, 0).await;
    accept_schedule(&node).await;
    Mock::given(method("POST"))
        .and(path("/cancel.json"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&node)
        .await;
    let harness = Harness::probed(&[("n1", &node)], admission_config(1)).await;

    harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes").with_job_id("c-2"))
        .await
        .unwrap();

    let outcome = harness.scheduler.cancel("demo", "c-2").await.unwrap();
    assert!(outcome.cancelled);
    assert!(!outcome.remote_confirmed);
    assert_eq!(harness.scheduler.job("c-2").await.unwrap().state, JobState::Cancelled);
}

#[tokio::test]
async fn test_cancel_unknown_job_searches_backends() {
    let a = mock_backend(0, 0).await;
    let b = mock_backend(0, 0).await;
    mount_listing(&a, &[], &[], &[]).await;
    mount_listing(&b, &[], &["external-1"], &["old-1"]).await;
    accept_cancel(&b, "running").await;
    let harness = Harness::probed(&[("a", &a), ("b", &b)], admission_config(1)).await;

    let outcome = harness.scheduler.cancel("demo", "external-1").await.unwrap();
    assert!(outcome.cancelled);
    assert_eq!(outcome.node.as_deref(), Some("b"));
    assert_eq!(outcome.previous_state, "running");

    let finished = harness.scheduler.cancel("demo", "old-1").await.unwrap();
    assert!(!finished.cancelled);
    assert_eq!(finished.state, "finished");

    let err = harness.scheduler.cancel("demo", "missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ============================================================================
// Listing and Tracking Tests
// ============================================================================

#[tokio::test]
async fn test_list_merges_backends_and_local_jobs() {
    let up = mock_backend(0, 0).await;
    let down = mock_backend(0, 0).await;
    accept_schedule(&up).await;
    mount_listing(&up, &["p-1"], &[], &[]).await;
    Mock::given(method("GET"))
        .and(path("/listjobs.json"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&down)
        .await;
    let harness = Harness::probed(&[("down", &down), ("up", &up)], admission_config(1)).await;

    harness
        .scheduler
        .schedule(JobRequest::new("demo", "quotes").with_job_id("p-1"))
        .await
        .unwrap();

    let listing = harness.scheduler.list("demo").await.unwrap();
    assert_eq!(listing.backends.len(), 2);

    let up_listing = listing.backends.iter().find(|b| b.node == "up").unwrap();
    assert_eq!(up_listing.jobs.as_ref().unwrap().pending.len(), 1);
    let down_listing = listing.backends.iter().find(|b| b.node == "down").unwrap();
    assert!(down_listing.jobs.is_none());
    assert!(down_listing.error.is_some());

    assert_eq!(listing.local.get("dispatched").map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_tracker_finishes_jobs_and_releases_leases() {
    let node = mock_backend(0, 0).await;
    accept_schedule(&node).await;
    mount_listing(&node, &[], &["runner"], &["done"]).await;
    let harness = Harness::probed(&[("n1", &node)], admission_config(2)).await;

    for id in ["runner", "done"] {
        harness
            .scheduler
            .schedule(JobRequest::new("demo", "quotes").with_job_id(id).with_browser(true))
            .await
            .unwrap();
    }
    assert_eq!(harness.live_leases().await, 2);

    let tracker = JobTracker::new(Arc::clone(&harness.scheduler), Duration::from_secs(60));
    let summary = tracker.reconcile().await;

    assert_eq!(summary.checked, 2);
    assert_eq!(summary.running, 1);
    assert_eq!(summary.finished, 1);
    assert_eq!(summary.renewed, 1);
    assert_eq!(harness.scheduler.job("runner").await.unwrap().state, JobState::Running);
    assert_eq!(harness.scheduler.job("done").await.unwrap().state, JobState::Finished);
    assert_eq!(harness.live_leases().await, 1);
}
