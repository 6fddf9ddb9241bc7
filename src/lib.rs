//! # Admission Guard
//!
//! A request admission and threat-mitigation pipeline for Axum services:
//!
//! - **Threat scanning**: injection, XSS and traversal signatures across the
//!   path, query, headers and body, plus payload and parameter-count limits
//! - **Route quotas**: named fixed-window policies with blocking, counted in
//!   Redis when available and in process memory when not
//! - **Geographic gate**: single-country restriction with IP allow and deny lists
//! - **Dynamic CORS**: origin allow-list editable at runtime
//! - **Observability**: structured logs, request IDs, Prometheus metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CORS → Request ID → Trace → Admission → (Admin Auth)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Admission stages: Threat → Quota → Geo                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  QuotaLimiter: Redis store ⇄ local fallback (breaker)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  GeoGate: range table, settings snapshot, IP lists          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use admission_guard::{AppState, Config, build_router_with};
//! use axum::{Router, routing::get};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config).await?;
//!
//!     let api = Router::new().route("/api/items", get(|| async { "[]" }));
//!     let app = build_router_with(state, api);
//!
//!     // Serve with `into_make_service_with_connect_info::<SocketAddr>()`...
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```bash
//! REDIS_URL=redis://localhost:6379 GEO_RESTRICTION_ENABLED=true \
//!   GEOIP_DATABASE_PATH=./geo.csv ADMIN_API_KEY=change-me cargo run
//! ```

pub mod config;
pub mod error;
pub mod geo;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod quota;
pub mod routes;
pub mod settings;
pub mod state;
pub mod threat;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use quota::{QuotaDecision, QuotaLimiter, RateLimitPolicy};
pub use routes::{build_router, build_router_with};
pub use state::AppState;
