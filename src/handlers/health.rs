//! Health and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Service health including quota store state
//! - `GET /ready` - Kubernetes-compatible readiness probe
//!
//! # Health vs Readiness
//!
//! - **Health** (`/health`): Always 200; `degraded` while quotas are served
//!   from the local store because the shared store is unreachable
//! - **Readiness** (`/ready`): 503 once shutdown has begun
//!
//! Both paths are exempt from quotas and excluded from the country gate.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// ```json
/// {
///   "status": "healthy",
///   "quota_store": { "backend": "redis", "circuit": "closed", "degraded": false, ... },
///   "geoip_loaded": true,
///   "version": "0.1.0",
///   "uptime_seconds": 42,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let quota_store = state.limiter.status().await;

    Json(HealthResponse {
        status: if quota_store.degraded {
            "degraded"
        } else {
            "healthy"
        }
        .to_string(),
        quota_store,
        geoip_loaded: state.resolver.is_loaded(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint.
///
/// A degraded quota store does not make the service unready: admission keeps
/// working from the local store.
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.is_shutting_down() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}
