//! Administrative endpoints.
//!
//! Mounted under `/admin` only when `ADMIN_API_KEY` is set, behind
//! [`AdminAuth`](crate::middleware::AdminAuth). Every write is idempotent and
//! last-write-wins; the response says whether anything changed.
//!
//! | Method | Path | Body |
//! |--------|------|------|
//! | GET | `/admin/origins` | |
//! | POST / DELETE | `/admin/origins` | `{"origin": "..."}` |
//! | GET | `/admin/ip-lists` | |
//! | POST / DELETE | `/admin/ip-lists/{allow\|deny}` | `{"pattern": "..."}` |
//! | GET | `/admin/rate-limits` | |
//! | DELETE | `/admin/rate-limits` | `{"policy", "ip", "method"?, "path"}` |

use axum::Json;
use axum::extract::{Path, State};
use axum::http::Method;
use tracing::{info, instrument};

use crate::error::{AppError, AppResult};
use crate::geo::{IpListsListing, ListKind};
use crate::middleware::cors::OriginListing;
use crate::middleware::ip::{UNKNOWN_IP, parse_ip};
use crate::models::{IpPatternRequest, OriginRequest, QuotaResetRequest, UpdatedResponse};
use crate::quota::{QuotaError, RateLimitKey, RateLimitPolicy};
use crate::state::AppState;

// =============================================================================
// Origins
// =============================================================================

#[instrument(skip(state))]
pub async fn list_origins(State(state): State<AppState>) -> Json<OriginListing> {
    Json(state.origins.snapshot().listing())
}

#[instrument(skip(state))]
pub async fn add_origin(
    State(state): State<AppState>,
    Json(req): Json<OriginRequest>,
) -> AppResult<Json<UpdatedResponse>> {
    let changed = state
        .origins
        .add(&req.origin)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    Ok(Json(UpdatedResponse::new(changed)))
}

#[instrument(skip(state))]
pub async fn remove_origin(
    State(state): State<AppState>,
    Json(req): Json<OriginRequest>,
) -> Json<UpdatedResponse> {
    Json(UpdatedResponse::new(state.origins.remove(&req.origin)))
}

// =============================================================================
// IP lists
// =============================================================================

fn list_kind(raw: &str) -> AppResult<ListKind> {
    raw.parse()
        .map_err(|e: String| AppError::NotFound(format!("IP list: {e}")))
}

#[instrument(skip(state))]
pub async fn list_ip_lists(State(state): State<AppState>) -> Json<IpListsListing> {
    Json(state.geo.lists().listing())
}

#[instrument(skip(state))]
pub async fn add_ip_pattern(
    State(state): State<AppState>,
    Path(list): Path<String>,
    Json(req): Json<IpPatternRequest>,
) -> AppResult<Json<UpdatedResponse>> {
    let kind = list_kind(&list)?;
    let changed = state
        .geo
        .lists()
        .add(kind, &req.pattern)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    if changed {
        info!(list = %list, pattern = %req.pattern, "IP list entry added");
    }
    Ok(Json(UpdatedResponse::new(changed)))
}

#[instrument(skip(state))]
pub async fn remove_ip_pattern(
    State(state): State<AppState>,
    Path(list): Path<String>,
    Json(req): Json<IpPatternRequest>,
) -> AppResult<Json<UpdatedResponse>> {
    let kind = list_kind(&list)?;
    let changed = state.geo.lists().remove(kind, &req.pattern);
    if changed {
        info!(list = %list, pattern = %req.pattern, "IP list entry removed");
    }
    Ok(Json(UpdatedResponse::new(changed)))
}

// =============================================================================
// Rate limits
// =============================================================================

#[instrument(skip(state))]
pub async fn list_policies(State(state): State<AppState>) -> Json<Vec<RateLimitPolicy>> {
    Json(state.limiter.registry().policies().to_vec())
}

/// Clear one counter and its block.
#[instrument(skip(state))]
pub async fn reset_rate_limit(
    State(state): State<AppState>,
    Json(req): Json<QuotaResetRequest>,
) -> AppResult<Json<UpdatedResponse>> {
    let ip = match parse_ip(&req.ip) {
        Some(ip) => ip.to_string(),
        // Clients with no resolvable address share the sentinel's counter
        None if req.ip.trim().eq_ignore_ascii_case(UNKNOWN_IP) => UNKNOWN_IP.to_string(),
        None => return Err(AppError::BadRequest(format!("Invalid IP address: {}", req.ip))),
    };
    let method = match req.method.as_deref() {
        None => Method::GET,
        Some(raw) => Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| AppError::BadRequest(format!("Invalid method: {raw}")))?,
    };

    let key = RateLimitKey::new(&req.policy, &ip, &method, &req.path);
    state
        .limiter
        .reset(&req.policy, &key)
        .await
        .map_err(|e| match e {
            QuotaError::UnknownPolicy(name) => {
                AppError::NotFound(format!("Rate limit policy '{name}'"))
            }
            QuotaError::Store(e) => AppError::Internal(format!("Quota reset failed: {e}")),
        })?;

    info!(policy = %req.policy, ip = %ip, route = %key.route, "Rate limit reset");
    Ok(Json(UpdatedResponse::new(true)))
}
