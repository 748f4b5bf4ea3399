//! Common test utilities
//!
//! Backends are wiremock servers speaking the Scrapyd JSON protocol; the
//! scheduler is wired the same way `GatewayServer::new` wires it, with an
//! in-memory ledger and fast retry/admission timings.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crawlgate::admission::{AdmissionController, MemoryLedger};
use crawlgate::backend::{BackendClient, BackendClients, HttpBackendClient};
use crawlgate::config::{AdmissionConfig, BackendConfig, RotationConfig};
use crawlgate::registry::{BackendRegistry, HealthProber};
use crawlgate::rotation::RotationStore;
use crawlgate::scheduler::Scheduler;
use crawlgate::utils::retry::RetryConfig;

// ============================================================================
// Mock Backends
// ============================================================================

/// Start a backend reporting the given load
pub async fn mock_backend(running: u32, pending: u32) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/daemonstatus.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "ok",
            "running": running,
            "pending": pending,
            "finished": 0,
            "node_name": "mock"
        })))
        .mount(&server)
        .await;
    server
}

/// Accept every `schedule.json` submission
pub async fn accept_schedule(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/schedule.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(server)
        .await;
}

/// Answer `schedule.json` with an application-level error
pub async fn reject_schedule(server: &MockServer, message: &str) {
    Mock::given(method("POST"))
        .and(path("/schedule.json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"status": "error", "message": message})),
        )
        .mount(server)
        .await;
}

/// Answer `schedule.json` with a server error
pub async fn fail_schedule(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path("/schedule.json"))
        .respond_with(ResponseTemplate::new(status).set_body_string("unavailable"))
        .mount(server)
        .await;
}

/// Accept `cancel.json`
pub async fn accept_cancel(server: &MockServer, prevstate: &str) {
    Mock::given(method("POST"))
        .and(path("/cancel.json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"status": "ok", "prevstate": prevstate})),
        )
        .mount(server)
        .await;
}

/// Serve a fixed `listjobs.json`
pub async fn mount_listing(server: &MockServer, pending: &[&str], running: &[&str], finished: &[&str]) {
    let jobs = |ids: &[&str]| -> Value {
        ids.iter()
            .map(|id| json!({"id": id, "spider": "quotes"}))
            .collect()
    };
    Mock::given(method("GET"))
        .and(path("/listjobs.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "ok",
            "pending": jobs(pending),
            "running": jobs(running),
            "finished": jobs(finished),
        })))
        .mount(server)
        .await;
}

/// Bodies of every `schedule.json` request a backend received
pub async fn submitted_forms(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == "/schedule.json")
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .collect()
}

// ============================================================================
// Scheduler Harness
// ============================================================================

/// Fast admission timings for tests
pub fn admission_config(max: u32) -> AdmissionConfig {
    AdmissionConfig {
        max_concurrent_sessions: max,
        lease_ttl_ms: 60_000,
        sweep_interval_ms: 50,
        acquire_timeout_ms: 150,
        poll_interval_ms: 20,
        browser_task_types: vec!["rendered".to_string()],
    }
}

/// Retry once with millisecond delays
pub fn fast_retry() -> RetryConfig {
    RetryConfig::with_delays(1, 1, 5).without_jitter()
}

/// A scheduler wired to mock backends plus the prober that feeds its registry
pub struct Harness {
    pub scheduler: Arc<Scheduler>,
    pub prober: HealthProber,
    pub registry: Arc<BackendRegistry>,
    pub admission: Arc<AdmissionController>,
}

impl Harness {
    /// Build without probing; every node starts `Unknown`
    pub fn new(backends: &[(&str, &MockServer)], admission: AdmissionConfig) -> Self {
        Self::configured(backends, admission, |scheduler| scheduler)
    }

    /// Build without probing, adjusting the scheduler before it is shared
    pub fn configured(
        backends: &[(&str, &MockServer)],
        admission: AdmissionConfig,
        configure: impl FnOnce(Scheduler) -> Scheduler,
    ) -> Self {
        let configs: Vec<BackendConfig> = backends
            .iter()
            .map(|(id, server)| BackendConfig::new(*id, server.uri()))
            .collect();

        let mut clients = BackendClients::new();
        for config in &configs {
            let client = HttpBackendClient::new(config, fast_retry())
                .expect("client")
                .with_probe_timeout(Duration::from_millis(500))
                .with_request_timeout(Duration::from_secs(2));
            clients.insert(config.id.clone(), Arc::new(client) as Arc<dyn BackendClient>);
        }

        let registry = Arc::new(BackendRegistry::new(&configs, 3));
        let admission_controller = Arc::new(AdmissionController::new(
            Arc::new(MemoryLedger::new()),
            &admission,
        ));
        let rotation = Arc::new(RotationStore::from_config(&RotationConfig::default()));
        let scheduler = Arc::new(configure(Scheduler::new(
            Arc::clone(&registry),
            clients.clone(),
            Arc::clone(&admission_controller),
            rotation,
            &admission,
        )));
        let prober = HealthProber::new(Arc::clone(&registry), clients, Duration::from_millis(100));

        Self {
            scheduler,
            prober,
            registry,
            admission: admission_controller,
        }
    }

    /// Build and probe every node once
    pub async fn probed(backends: &[(&str, &MockServer)], admission: AdmissionConfig) -> Self {
        let harness = Self::new(backends, admission);
        harness.prober.probe_all().await;
        harness
    }

    /// Build with `configure` and probe every node once
    pub async fn probed_with(
        backends: &[(&str, &MockServer)],
        admission: AdmissionConfig,
        configure: impl FnOnce(Scheduler) -> Scheduler,
    ) -> Self {
        let harness = Self::configured(backends, admission, configure);
        harness.prober.probe_all().await;
        harness
    }

    pub async fn live_leases(&self) -> usize {
        self.admission.status().await.expect("status").live_leases
    }
}
