//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Answers preflights, origin checked against the live registry
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Sets and propagates X-Request-Id
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response spans
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │    Admission     │ ← Threat 400/413 → Quota 429 → Geo 403, security headers
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │   Admin Auth     │ ← /admin/* only, 401/429
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! - `/health`, `/ready` - Health probes
//! - `/ws` - WebSocket endpoint with the country gate applied on connect
//! - `/admin/*` - Origin, IP list and quota administration (only with `ADMIN_API_KEY`)

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{self, admin, socket::SOCKET_PATH};
use crate::middleware::{AdminAuth, AdmissionLayer, cors_layer};
use crate::state::AppState;

/// Build the router with only the built-in routes.
pub fn build_router(state: AppState) -> Router {
    build_router_with(state, Router::new())
}

/// Mount the built-in routes next to `app` and wrap everything in the
/// admission stack.
pub fn build_router_with(state: AppState, app: Router<AppState>) -> Router {
    let config = &state.config;

    let mut router = app
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route(SOCKET_PATH, get(handlers::ws_handler));

    // =========================================================================
    // Admin routes (only when a key is configured)
    // =========================================================================
    match &config.admin_api_key {
        Some(key) => {
            info!("Admin API enabled under /admin");
            let admin_routes = Router::new()
                .route(
                    "/origins",
                    get(admin::list_origins)
                        .post(admin::add_origin)
                        .delete(admin::remove_origin),
                )
                .route("/ip-lists", get(admin::list_ip_lists))
                .route(
                    "/ip-lists/{list}",
                    post(admin::add_ip_pattern).delete(admin::remove_ip_pattern),
                )
                .route(
                    "/rate-limits",
                    get(admin::list_policies).delete(admin::reset_rate_limit),
                )
                .layer(AdminAuth::new(key.clone(), state.identity.clone()));
            router = router.nest("/admin", admin_routes);
        }
        None => info!("Admin API disabled (no ADMIN_API_KEY set)"),
    }

    // =========================================================================
    // Middleware stack (last added runs first)
    // =========================================================================
    router = router.layer(DefaultBodyLimit::max(config.max_payload_bytes));
    router = router.layer(AdmissionLayer::new(state.pipeline.clone()));
    router = router.layer(TraceLayer::new_for_http());
    router = router.layer(PropagateRequestIdLayer::x_request_id());
    router = router.layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));
    router = router.layer(cors_layer(state.origins.clone()));

    router.with_state(state)
}
