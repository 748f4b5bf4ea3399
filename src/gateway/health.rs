//! Liveness and readiness endpoints
//!
//! Liveness only says the process is serving. Readiness requires at least one
//! online backend and a reachable admission ledger.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use super::server::AppState;

/// `GET /health/live`
#[derive(Debug, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// `GET /health/ready`
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub backends_online: usize,
    pub backends_total: usize,
    pub ledger: String,
    pub ledger_ok: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

pub(crate) async fn liveness(State(state): State<AppState>) -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "alive".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

pub(crate) async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let scheduler = &state.scheduler;
    let stats = scheduler.registry().stats().await;
    let mut reasons = Vec::new();

    if stats.online == 0 {
        reasons.push("no backend online".to_string());
    }
    let ledger_ok = match scheduler.admission().status().await {
        Ok(_) => true,
        Err(e) => {
            reasons.push(format!("ledger unavailable: {e}"));
            false
        }
    };

    let ready = reasons.is_empty();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            backends_online: stats.online,
            backends_total: stats.total_nodes,
            ledger: scheduler.admission().ledger_name().to_string(),
            ledger_ok,
            reasons,
        }),
    )
}
