//! REST API handlers for the gateway
//!
//! Every rejection is a JSON body `{"error_kind": ..., "message": ...}` where
//! `error_kind` is the stable [`ErrorKind`] code.

use axum::{
    extract::{rejection::JsonRejection, MatchedPath, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

use crate::admission::AdmissionStatus;
use crate::error::{ClassifiedError, ErrorKind};
use crate::intake::QueueDepth;
use crate::metrics;
use crate::models::{Job, JobRequest};
use crate::registry::{BackendNode, RegistryStats};
use crate::rotation::{IdentityRecord, ProxyRecord, RotationCatalog};
use crate::scheduler::{CancelOutcome, ProjectListing, ScheduleResponse};

use super::health::{liveness, readiness};
use super::server::AppState;

/// Header carrying the admin key
pub const API_KEY_HEADER: &str = "x-api-key";

// ============================================================================
// Errors
// ============================================================================

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_kind: ErrorKind,
    pub message: String,
}

/// An error ready to be sent to the caller
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: status_for(kind),
            body: ErrorBody {
                error_kind: kind,
                message: message.into(),
            },
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: ErrorBody {
                error_kind: ErrorKind::InvalidRequest,
                message: format!("missing or invalid {API_KEY_HEADER} header"),
            },
        }
    }
}

impl<E: ClassifiedError> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// HTTP status for an error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NoCapacity | ErrorKind::ResourceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Ledger | ErrorKind::Broker => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::BackendUnreachable => StatusCode::BAD_GATEWAY,
        ErrorKind::BackendRejected => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::DuplicateTask => StatusCode::OK,
        ErrorKind::LeaseExpired | ErrorKind::Config | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// API Response Types
// ============================================================================

/// `GET /`
#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service: String,
    pub version: String,
    pub uptime_secs: u64,
    pub ledger: String,
    pub backends: usize,
    pub intake_enabled: bool,
}

/// `GET /status`
#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub backends: Vec<BackendNode>,
    pub registry: RegistryStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admission: Option<AdmissionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admission_error: Option<String>,
    /// Local job counts by state
    pub jobs: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intake: Option<QueueDepth>,
}

/// Body for the proxy endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub url: String,
}

/// Body for `POST /rotation/identities`
#[derive(Debug, Serialize, Deserialize)]
pub struct IdentityRequest {
    pub value: String,
    pub device_class: String,
    pub browser_family: String,
}

/// Result of an admin add
#[derive(Debug, Serialize, Deserialize)]
pub struct AddedResponse {
    pub added: bool,
}

/// Result of the admission reset
#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    pub reset: bool,
    pub max_concurrent_sessions: u32,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/status", get(gateway_status))
        // Jobs
        .route("/schedule", post(schedule_job))
        .route("/list-jobs/{project}", get(list_jobs))
        .route("/cancel/{project}/{job_id}", get(cancel_job).post(cancel_job))
        .route("/jobs/{job_id}", get(get_job))
        // Admin
        .route("/admin/reset-admission-counter", post(reset_admission))
        // Rotation
        .route("/rotation", get(rotation_catalog))
        .route("/rotation/proxies", post(add_proxy))
        .route("/rotation/proxies/failure", post(proxy_failure))
        .route("/rotation/identities", post(add_identity))
        // Health
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .route_layer(middleware::from_fn(track_requests))
        .with_state(state)
}

/// Record request count and latency per matched route
async fn track_requests(request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();

    let response = next.run(request).await;
    metrics::record_api_request(&endpoint, response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

// ============================================================================
// Info Handlers
// ============================================================================

async fn service_info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        ledger: state.scheduler.admission().ledger_name().to_string(),
        backends: state.config.backends.len(),
        intake_enabled: state.intake.is_some(),
    })
}

async fn gateway_status(State(state): State<AppState>) -> Json<GatewayStatus> {
    let scheduler = &state.scheduler;
    let (admission, admission_error) = match scheduler.admission().status().await {
        Ok(status) => (Some(status), None),
        Err(e) => (None, Some(e.to_string())),
    };

    let jobs = scheduler
        .jobs()
        .counts()
        .await
        .into_iter()
        .map(|(job_state, count)| (job_state.to_string(), count))
        .collect();

    let intake = match &state.intake {
        Some(intake) => intake.broker().depth().await.ok(),
        None => None,
    };

    Json(GatewayStatus {
        backends: scheduler.registry().snapshot().await,
        registry: scheduler.registry().stats().await,
        admission,
        admission_error,
        jobs,
        intake,
    })
}

// ============================================================================
// Job Handlers
// ============================================================================

async fn schedule_job(
    State(state): State<AppState>,
    body: Result<Json<JobRequest>, JsonRejection>,
) -> ApiResult<ScheduleResponse> {
    let Json(request) = body.map_err(|e| ApiError::new(ErrorKind::InvalidRequest, e.body_text()))?;
    Ok(Json(state.scheduler.schedule(request).await?))
}

async fn list_jobs(State(state): State<AppState>, Path(project): Path<String>) -> ApiResult<ProjectListing> {
    Ok(Json(state.scheduler.list(&project).await?))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path((project, job_id)): Path<(String, String)>,
) -> ApiResult<CancelOutcome> {
    Ok(Json(state.scheduler.cancel(&project, &job_id).await?))
}

async fn get_job(State(state): State<AppState>, Path(job_id): Path<String>) -> ApiResult<Job> {
    Ok(Json(state.scheduler.job(&job_id).await?))
}

// ============================================================================
// Admin Handlers
// ============================================================================

fn check_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.server.admin_api_key.as_deref() else {
        return Ok(());
    };
    let provided = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

async fn reset_admission(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<ResetResponse> {
    check_api_key(&state, &headers)?;
    let admission = state.scheduler.admission();
    admission.reset_all().await?;
    Ok(Json(ResetResponse {
        reset: true,
        max_concurrent_sessions: admission.policy().max,
    }))
}

// ============================================================================
// Rotation Handlers
// ============================================================================

async fn rotation_catalog(State(state): State<AppState>) -> Json<RotationCatalog> {
    Json(state.scheduler.rotation().catalog().await)
}

async fn add_proxy(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ProxyRequest>, JsonRejection>,
) -> ApiResult<AddedResponse> {
    check_api_key(&state, &headers)?;
    let Json(request) = body.map_err(|e| ApiError::new(ErrorKind::InvalidRequest, e.body_text()))?;
    let added = state.scheduler.rotation().add_proxy(&request.url).await?;
    Ok(Json(AddedResponse { added }))
}

async fn proxy_failure(
    State(state): State<AppState>,
    body: Result<Json<ProxyRequest>, JsonRejection>,
) -> ApiResult<ProxyRecord> {
    let Json(request) = body.map_err(|e| ApiError::new(ErrorKind::InvalidRequest, e.body_text()))?;
    Ok(Json(state.scheduler.rotation().record_proxy_failure(&request.url).await?))
}

async fn add_identity(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<IdentityRequest>, JsonRejection>,
) -> ApiResult<AddedResponse> {
    check_api_key(&state, &headers)?;
    let Json(request) = body.map_err(|e| ApiError::new(ErrorKind::InvalidRequest, e.body_text()))?;
    let record = IdentityRecord::new(request.value, request.device_class, request.browser_family);
    let added = state.scheduler.rotation().add_identity(record).await?;
    Ok(Json(AddedResponse { added }))
}

// ============================================================================
// Metrics
// ============================================================================

async fn prometheus_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => ApiError::new(ErrorKind::Internal, e.to_string()).into_response(),
    }
}
