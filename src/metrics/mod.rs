//! Prometheus metrics for the crawlgate gateway
//!
//! This module provides metrics tracking for:
//! - Scheduling: outcomes per job, dispatch failures per node
//! - Admission: live leases, wait-queue depth, lease expirations, wait time
//! - Backends: reachability and load per node, probe failures
//! - Intake: message outcomes
//! - API: request counts and latency
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all gateway metrics
struct GatewayMetrics {
    jobs_scheduled: CounterVec,
    dispatch_failures: CounterVec,
    live_leases: Gauge,
    wait_queue_depth: Gauge,
    lease_expirations: Counter,
    acquire_wait: HistogramVec,
    backend_online: GaugeVec,
    backend_load: GaugeVec,
    probe_failures: CounterVec,
    proxy_healthy: Gauge,
    intake_messages: CounterVec,
    api_requests: CounterVec,
    api_duration: HistogramVec,
}

/// Global storage for gateway metrics
static GATEWAY_METRICS: OnceLock<GatewayMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, subsequent metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = crawlgate::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = GatewayMetrics {
        jobs_scheduled: register_counter_vec!(
            "crawlgate_jobs_scheduled_total",
            "Scheduling outcomes (dispatched, duplicate, or an error kind)",
            &["outcome"]
        )?,
        dispatch_failures: register_counter_vec!(
            "crawlgate_dispatch_failures_total",
            "Dispatch attempts that exhausted retries against a node",
            &["node"]
        )?,
        live_leases: register_gauge!(
            "crawlgate_admission_live_leases",
            "Browser-session leases currently held"
        )?,
        wait_queue_depth: register_gauge!(
            "crawlgate_admission_wait_queue_depth",
            "Jobs waiting for a browser-session lease"
        )?,
        lease_expirations: register_counter!(
            "crawlgate_admission_lease_expirations_total",
            "Leases reclaimed by the expiry sweep"
        )?,
        acquire_wait: register_histogram_vec!(
            "crawlgate_admission_acquire_wait_seconds",
            "Time spent waiting for a lease",
            &["outcome"],
            vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
        )?,
        backend_online: register_gauge_vec!(
            "crawlgate_backend_online",
            "Whether the backend is online (1) or not (0)",
            &["node"]
        )?,
        backend_load: register_gauge_vec!(
            "crawlgate_backend_load",
            "Running plus pending jobs last reported by the backend",
            &["node"]
        )?,
        probe_failures: register_counter_vec!(
            "crawlgate_backend_probe_failures_total",
            "Failed health probes",
            &["node"]
        )?,
        proxy_healthy: register_gauge!(
            "crawlgate_proxies_healthy",
            "Proxies that passed the last health check"
        )?,
        intake_messages: register_counter_vec!(
            "crawlgate_intake_messages_total",
            "Queue messages by outcome (acked, requeued, dead_lettered)",
            &["outcome"]
        )?,
        api_requests: register_counter_vec!(
            "crawlgate_api_requests_total",
            "Total API requests by endpoint and status",
            &["endpoint", "status"]
        )?,
        api_duration: register_histogram_vec!(
            "crawlgate_api_request_duration_seconds",
            "API request duration in seconds",
            &["endpoint"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        )?,
    };

    GATEWAY_METRICS
        .set(metrics)
        .map_err(|_| "Gateway metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    GATEWAY_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record the outcome of one `schedule` call
pub fn record_schedule_outcome(outcome: &str) {
    if let Some(m) = GATEWAY_METRICS.get() {
        m.jobs_scheduled.with_label_values(&[outcome]).inc();
    }
}

/// Record a node that failed dispatch after all retries
pub fn record_dispatch_failure(node: &str) {
    if let Some(m) = GATEWAY_METRICS.get() {
        m.dispatch_failures.with_label_values(&[node]).inc();
    }
}

/// Update admission gauges
pub fn update_admission_metrics(live_leases: usize, queued: usize) {
    if let Some(m) = GATEWAY_METRICS.get() {
        m.live_leases.set(live_leases as f64);
        m.wait_queue_depth.set(queued as f64);
    }
}

/// Record leases reclaimed by the sweep
pub fn record_lease_expirations(count: usize) {
    if count == 0 {
        return;
    }
    if let Some(m) = GATEWAY_METRICS.get() {
        m.lease_expirations.inc_by(count as f64);
    }
}

/// Record how long an `acquire` call waited
pub fn record_acquire_wait(outcome: &str, duration_secs: f64) {
    if let Some(m) = GATEWAY_METRICS.get() {
        m.acquire_wait
            .with_label_values(&[outcome])
            .observe(duration_secs);
    }
}

/// Update per-node reachability and load
pub fn update_backend_metrics(node: &str, online: bool, load: u32) {
    let Some(m) = GATEWAY_METRICS.get() else {
        return;
    };

    m.backend_online
        .with_label_values(&[node])
        .set(if online { 1.0 } else { 0.0 });
    m.backend_load.with_label_values(&[node]).set(load as f64);
}

/// Record a failed health probe
pub fn record_probe_failure(node: &str) {
    if let Some(m) = GATEWAY_METRICS.get() {
        m.probe_failures.with_label_values(&[node]).inc();
    }
}

/// Update the count of proxies passing health checks
pub fn update_proxy_health(healthy: usize) {
    if let Some(m) = GATEWAY_METRICS.get() {
        m.proxy_healthy.set(healthy as f64);
    }
}

/// Record an intake message outcome
pub fn record_intake_message(outcome: &str) {
    if let Some(m) = GATEWAY_METRICS.get() {
        m.intake_messages.with_label_values(&[outcome]).inc();
    }
}

/// Record API request
pub fn record_api_request(endpoint: &str, status: u16, duration_secs: f64) {
    let Some(m) = GATEWAY_METRICS.get() else {
        return;
    };

    let status_str = status.to_string();
    m.api_requests
        .with_label_values(&[endpoint, &status_str])
        .inc();
    m.api_duration
        .with_label_values(&[endpoint])
        .observe(duration_secs);
}

// ============================================================================
// Tests
// ============================================================================
