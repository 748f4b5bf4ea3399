//! HTTP gateway
//!
//! Synchronous front door: scheduling, cancellation, listings, admin and
//! rotation endpoints, health and metrics.

pub mod api;
pub mod health;
pub mod server;

pub use api::{create_router, status_for, ApiError, ErrorBody, API_KEY_HEADER};
pub use health::{LivenessResponse, ReadinessResponse};
pub use server::{AppState, GatewayServer, ServerError, ServerInfo};
