//! Admin API key authentication.
//!
//! Guards the `/admin/*` router. The key travels in the `X-Admin-Key` header
//! only; query-string keys are not accepted.
//!
//! ```bash
//! curl -H "X-Admin-Key: $ADMIN_API_KEY" http://localhost:3000/admin/origins
//! ```
//!
//! # Security Features
//!
//! - **Constant-time comparison** via `subtle`
//! - **Per-IP failure limiter**: only failed attempts are metered; once a
//!   client exhausts its failure budget it gets 429 until the budget refills,
//!   before its key is even compared

use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::Json;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use serde_json::json;
use subtle::ConstantTimeEq;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::ip::{ClientIdentity, IdentityResolver};
use crate::error::{AppError, ErrorBody};

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Auth failures per IP per minute before blocking.
const AUTH_FAILURE_LIMIT: NonZeroU32 = NonZeroU32::new(10).unwrap();

const AUTH_FAILURE_BURST: NonZeroU32 = NonZeroU32::new(5).unwrap();

type AuthFailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

#[derive(Clone)]
pub struct AdminAuth {
    expected_key: Arc<String>,
    resolver: Arc<IdentityResolver>,
    failure_limiter: Arc<AuthFailureLimiter>,
    /// IPs that exhausted the failure budget, until when.
    blocked: Arc<DashMap<String, Instant>>,
}

impl AdminAuth {
    pub fn new(api_key: String, resolver: Arc<IdentityResolver>) -> Self {
        let quota = Quota::per_minute(AUTH_FAILURE_LIMIT).allow_burst(AUTH_FAILURE_BURST);
        Self {
            expected_key: Arc::new(api_key),
            resolver,
            failure_limiter: Arc::new(RateLimiter::keyed(quota)),
            blocked: Arc::new(DashMap::new()),
        }
    }

    /// Seconds left on an active block, clearing expired ones.
    fn blocked_for(&self, client_ip: &str) -> Option<u64> {
        let until = self.blocked.get(client_ip).map(|entry| *entry)?;
        let now = Instant::now();
        if until > now {
            return Some((until - now).as_secs().max(1));
        }
        self.blocked.remove(client_ip);
        None
    }

    fn record_failure(&self, client_ip: &str) {
        if let Err(not_until) = self.failure_limiter.check_key(&client_ip.to_string()) {
            let wait = not_until
                .wait_time_from(DefaultClock::default().now())
                .max(Duration::from_secs(1));
            self.blocked.insert(client_ip.to_string(), Instant::now() + wait);
        }
    }
}

impl<S> Layer<S> for AdminAuth {
    type Service = AdminAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdminAuthService {
            inner,
            auth: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AdminAuthService<S> {
    inner: S,
    auth: AdminAuth,
}

impl<S> Service<Request<Body>> for AdminAuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let auth = self.auth.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // The admission layer has usually resolved identity already
            let client_ip = match req.extensions().get::<ClientIdentity>() {
                Some(identity) => identity.ip.clone(),
                None => auth.resolver.resolve_request(&req).ip,
            };

            if let Some(retry_after) = auth.blocked_for(&client_ip) {
                error!(
                    client_ip = %client_ip,
                    retry_after_secs = retry_after,
                    "IP blocked due to excessive admin auth failures"
                );
                return Ok(rate_limited_response(retry_after));
            }

            let provided = req
                .headers()
                .get(ADMIN_KEY_HEADER)
                .and_then(|v| v.to_str().ok());

            match provided {
                Some(key) if constant_time_eq(key, &auth.expected_key) => {
                    debug!(client_ip = %client_ip, "Admin key accepted");
                    inner.call(req).await
                }
                Some(_) => {
                    auth.record_failure(&client_ip);
                    warn!(path = %req.uri().path(), client_ip = %client_ip, "Invalid admin key");
                    Ok(AppError::Unauthorized("Invalid admin key".to_string()).into_response())
                }
                None => {
                    auth.record_failure(&client_ip);
                    warn!(path = %req.uri().path(), client_ip = %client_ip, "Missing admin key");
                    Ok(AppError::Unauthorized("Admin key required".to_string()).into_response())
                }
            }
        })
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn rate_limited_response(retry_after: u64) -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after.to_string())],
        Json(ErrorBody::new(
            "TOO_MANY_AUTH_FAILURES",
            "Too many failed authentication attempts. Please wait before retrying.",
        )
        .with_details(json!({ "retryAfter": retry_after }))),
    )
        .into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/admin/ping", get(|| async { "pong" }))
            .layer(AdminAuth::new(
                "s3cret".to_string(),
                Arc::new(IdentityResolver::default()),
            ))
    }

    fn request(key: Option<&str>, ip: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .uri("/admin/ping")
            .header("x-real-ip", ip);
        if let Some(key) = key {
            builder = builder.header(ADMIN_KEY_HEADER, key);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_valid_key_passes() {
        let response = app().oneshot(request(Some("s3cret"), "10.1.1.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_and_wrong_key_rejected() {
        let app = app();
        let missing = app.clone().oneshot(request(None, "10.1.1.2")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app.oneshot(request(Some("nope"), "10.1.1.2")).await.unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_repeated_failures_are_throttled() {
        let app = app();
        let mut last = StatusCode::OK;
        for _ in 0..10 {
            last = app
                .clone()
                .oneshot(request(Some("guess"), "10.1.1.3"))
                .await
                .unwrap()
                .status();
        }
        assert_eq!(last, StatusCode::TOO_MANY_REQUESTS);

        // Other clients are unaffected
        let other = app.oneshot(request(Some("s3cret"), "10.1.1.4")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_valid_requests_do_not_consume_failure_budget() {
        let app = app();
        for _ in 0..20 {
            let response = app
                .clone()
                .oneshot(request(Some("s3cret"), "10.1.1.5"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret123", "secret123"));
        assert!(!constant_time_eq("secret123", "secret456"));
        assert!(!constant_time_eq("short", "much-longer-string"));
    }
}
