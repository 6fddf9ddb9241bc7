//! Admission pipeline middleware.
//!
//! Runs every request through a fixed list of stages before the handler:
//!
//! ```text
//! Request
//!   │  resolve ClientIdentity (request extension)
//!   │  buffer body (≤ MAX_PAYLOAD_BYTES)          ── 413 PAYLOAD_TOO_LARGE
//!   ├─ Threat  : scan query/body/headers          ── 400 THREAT_DETECTED
//!   ├─ Quota   : policy check, X-RateLimit-*      ── 429 RATE_LIMIT_EXCEEDED
//!   ├─ Geo     : deny list, country gate          ── 403 IP_BLOCKED / REGION_RESTRICTED
//!   ▼
//! Handler
//!   │  failures-only quota consumed on status ≥ 400
//!   ▼
//! Response + security headers (also on rejections)
//! ```
//!
//! The first rejecting stage ends the request; handlers never see rejected
//! requests. No lock is held across stages.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::Json;
use axum::body::{Body, Bytes, HttpBody};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{HeaderMap, Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use http_body_util::LengthLimitError;
use serde_json::json;
use tower::{Layer, Service};
use tracing::{debug, error, info, warn};

use super::ip::{ClientIdentity, IdentityResolver};
use crate::error::ErrorBody;
use crate::geo::{GeoDecision, GeoGate};
use crate::metrics;
use crate::quota::{QuotaDecision, QuotaLimiter, RateLimitKey};
use crate::threat::{RequestSurfaces, ThreatCategory, ThreatFinding, ThreatScanner};

/// Headers set on every response unless the handler already set them.
const SECURITY_HEADERS: [(&str, &str); 7] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("strict-transport-security", "max-age=31536000; includeSubDomains"),
    ("content-security-policy", "default-src 'none'; frame-ancestors 'none'"),
    ("cross-origin-opener-policy", "same-origin"),
    ("permissions-policy", "geolocation=(), camera=(), microphone=()"),
];

pub fn apply_security_headers(headers: &mut HeaderMap) {
    for (name, value) in SECURITY_HEADERS {
        headers
            .entry(HeaderName::from_static(name))
            .or_insert(HeaderValue::from_static(value));
    }
}

// =============================================================================
// Rejections
// =============================================================================

/// Pipeline outcome that ends a request before the handler.
#[derive(Debug, Clone)]
pub enum Rejection {
    /// Hostile input. The finding is logged, never returned.
    Threat(ThreatFinding),
    PayloadTooLarge { limit: usize },
    UnreadableBody,
    RateLimited { policy: String, decision: QuotaDecision },
    RegionRestricted { ip: String, country: String },
    IpBlocked { ip: String },
}

impl Rejection {
    pub fn stage(&self) -> &'static str {
        match self {
            Rejection::Threat(_) | Rejection::PayloadTooLarge { .. } | Rejection::UnreadableBody => {
                "threat"
            }
            Rejection::RateLimited { .. } => "quota",
            Rejection::RegionRestricted { .. } | Rejection::IpBlocked { .. } => "geo",
        }
    }

    fn from_finding(finding: ThreatFinding, limit: usize) -> Self {
        match finding.category {
            ThreatCategory::OversizedPayload => Rejection::PayloadTooLarge { limit },
            _ => Rejection::Threat(finding),
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> axum::response::Response {
        match self {
            Rejection::Threat(_) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new(
                    "THREAT_DETECTED",
                    "The request contains disallowed content.",
                )),
            )
                .into_response(),
            Rejection::PayloadTooLarge { limit } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(
                    ErrorBody::new("PAYLOAD_TOO_LARGE", "Request payload is too large.")
                        .with_details(json!({ "maxBytes": limit })),
                ),
            )
                .into_response(),
            Rejection::UnreadableBody => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new("BAD_REQUEST", "Request body could not be read.")),
            )
                .into_response(),
            Rejection::RateLimited { policy, decision } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(
                        ErrorBody::new(
                            "RATE_LIMIT_EXCEEDED",
                            "Too many requests. Please retry later.",
                        )
                        .with_details(json!({
                            "policy": policy,
                            "retryAfter": decision.retry_after_secs(),
                            "limit": decision.limit,
                            "remaining": decision.remaining,
                        })),
                    ),
                )
                    .into_response();
                decision.apply_headers(response.headers_mut());
                response
            }
            Rejection::RegionRestricted { ip, country } => (
                StatusCode::FORBIDDEN,
                Json(
                    ErrorBody::new(
                        "REGION_RESTRICTED",
                        "This service is not available in your region.",
                    )
                    .with_details(json!({ "reason": "region_restricted", "ip": ip, "country": country })),
                ),
            )
                .into_response(),
            Rejection::IpBlocked { .. } => (
                StatusCode::FORBIDDEN,
                Json(ErrorBody::new("IP_BLOCKED", "Access from this address is blocked.")),
            )
                .into_response(),
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Threat,
    Quota,
    Geo,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Threat => "threat",
            Stage::Quota => "quota",
            Stage::Geo => "geo",
        }
    }
}

/// Stage order. Security headers wrap all of them.
const STAGES: [Stage; 3] = [Stage::Threat, Stage::Quota, Stage::Geo];

/// Mutable per-request view passed through the stages.
struct StageContext<'a> {
    identity: &'a ClientIdentity,
    method: &'a Method,
    path: &'a str,
    query: Option<&'a str>,
    headers: &'a HeaderMap,
    body: &'a Bytes,
    is_socket_upgrade: bool,
    /// Decision whose headers go on the handler's response.
    quota: Option<QuotaDecision>,
    /// Failures-only policy to charge after the handler.
    deferred: Option<(String, RateLimitKey)>,
}

/// Shared components for the admission stages.
pub struct Pipeline {
    resolver: Arc<IdentityResolver>,
    scanner: ThreatScanner,
    limiter: Arc<QuotaLimiter>,
    geo: Arc<GeoGate>,
    /// WebSocket endpoints that run the country gate themselves.
    socket_paths: Vec<String>,
    slow_response_threshold: Duration,
    large_response_bytes: u64,
}

impl Pipeline {
    pub fn new(
        resolver: Arc<IdentityResolver>,
        scanner: ThreatScanner,
        limiter: Arc<QuotaLimiter>,
        geo: Arc<GeoGate>,
    ) -> Self {
        Self {
            resolver,
            scanner,
            limiter,
            geo,
            socket_paths: Vec::new(),
            slow_response_threshold: Duration::from_secs(1),
            large_response_bytes: 1024 * 1024,
        }
    }

    pub fn with_socket_paths(mut self, paths: &[&str]) -> Self {
        self.socket_paths = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_response_thresholds(mut self, slow: Duration, large_bytes: u64) -> Self {
        self.slow_response_threshold = slow;
        self.large_response_bytes = large_bytes;
        self
    }

    async fn run_stage(&self, stage: Stage, ctx: &mut StageContext<'_>) -> Result<(), Rejection> {
        match stage {
            Stage::Threat => self.threat_stage(ctx),
            Stage::Quota => self.quota_stage(ctx).await,
            Stage::Geo => self.geo_stage(ctx),
        }
    }

    fn threat_stage(&self, ctx: &StageContext<'_>) -> Result<(), Rejection> {
        let report = self.scanner.scan(&RequestSurfaces {
            path: ctx.path,
            query: ctx.query,
            headers: ctx.headers,
            body: ctx.body,
        });

        if report.weak_user_agent {
            metrics::record_weak_user_agent();
            debug!(ip = %ctx.identity.ip, path = ctx.path, "Missing or short User-Agent");
        }

        for finding in &report.findings {
            metrics::record_threat(finding.category.as_str());
        }

        match report.findings.into_iter().next() {
            None => Ok(()),
            Some(finding) => {
                warn!(
                    ip = %ctx.identity.ip,
                    method = %ctx.method,
                    path = ctx.path,
                    category = %finding.category,
                    locator = %finding.locator,
                    sample = %finding.sample,
                    "Threat detected, request rejected"
                );
                Err(Rejection::from_finding(
                    finding,
                    self.scanner.max_payload_bytes(),
                ))
            }
        }
    }

    async fn quota_stage(&self, ctx: &mut StageContext<'_>) -> Result<(), Rejection> {
        let Some(policy) = self.limiter.registry().select(ctx.method, ctx.path) else {
            return Ok(());
        };
        let policy_name = policy.name.clone();
        let failures_only = policy.counts_failures_only;
        let key = RateLimitKey::new(&policy_name, &ctx.identity.ip, ctx.method, ctx.path);

        let result = if failures_only {
            match self.limiter.peek(&policy_name, &key).await {
                // The attempt past a spent budget is charged so the store
                // starts the penalty block; an active block is not extended
                Ok(peeked) if !peeked.allowed => self.limiter.check(&policy_name, &key).await,
                other => other,
            }
        } else {
            self.limiter.check(&policy_name, &key).await
        };

        let decision = match result {
            Ok(decision) => decision,
            Err(e) => {
                // Registry and limiter share one policy set; treat as a bug, fail open
                error!(error = %e, policy = %policy_name, "Quota check failed");
                return Ok(());
            }
        };

        if !decision.allowed {
            warn!(
                ip = %ctx.identity.ip,
                policy = %policy_name,
                key = %key.storage_key(&policy.key_prefix),
                retry_after_ms = decision.retry_after_ms,
                degraded = decision.degraded,
                "Rate limit exceeded"
            );
            return Err(Rejection::RateLimited {
                policy: policy_name,
                decision,
            });
        }

        if failures_only {
            ctx.deferred = Some((policy_name, key));
        }
        ctx.quota = Some(decision);
        Ok(())
    }

    fn geo_stage(&self, ctx: &StageContext<'_>) -> Result<(), Rejection> {
        // Socket handshakes are gated in the socket handler so the rejection
        // can be delivered as a close frame
        if ctx.is_socket_upgrade && self.socket_paths.iter().any(|p| p == ctx.path) {
            if self.geo.lists().is_denied(&ctx.identity.ip) {
                return Err(Rejection::IpBlocked {
                    ip: ctx.identity.ip.clone(),
                });
            }
            return Ok(());
        }

        match self.geo.allow(ctx.path, &ctx.identity.ip) {
            GeoDecision::Allowed(_) => Ok(()),
            GeoDecision::Rejected { ip, country } => {
                info!(ip = %ip, country = %country, path = ctx.path, "Region restricted");
                Err(Rejection::RegionRestricted { ip, country })
            }
            GeoDecision::Blocked { ip } => {
                warn!(ip = %ip, path = ctx.path, "Blocked IP rejected");
                Err(Rejection::IpBlocked { ip })
            }
        }
    }

    /// Charge a failures-only policy once the handler's status is known.
    async fn settle_deferred(
        &self,
        deferred: Option<(String, RateLimitKey)>,
        status: StatusCode,
    ) -> Option<QuotaDecision> {
        let (policy, key) = deferred?;
        if status.as_u16() < 400 {
            return None;
        }
        match self.limiter.check(&policy, &key).await {
            Ok(decision) => {
                if !decision.allowed {
                    warn!(ip = %key.client_ip, policy = %policy, "Failure quota exhausted");
                }
                Some(decision)
            }
            Err(e) => {
                error!(error = %e, policy = %policy, "Deferred quota charge failed");
                None
            }
        }
    }

    fn observe_response(&self, response: &Response<Body>, method: &Method, path: &str, elapsed: Duration) {
        if elapsed >= self.slow_response_threshold {
            metrics::record_slow_response();
            warn!(
                method = %method,
                path,
                status = response.status().as_u16(),
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "Slow response"
            );
        }

        let size = response.body().size_hint().exact().or_else(|| {
            response
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        });
        if let Some(size) = size
            && size > self.large_response_bytes
        {
            metrics::record_large_response();
            warn!(method = %method, path, bytes = size, "Large response");
        }
    }
}

/// Read the body up to `limit` bytes.
async fn buffer_body(body: Body, limit: usize) -> Result<Bytes, Rejection> {
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        let inner = e.into_inner();
        if inner.downcast_ref::<LengthLimitError>().is_some() {
            Rejection::PayloadTooLarge { limit }
        } else {
            debug!(error = %inner, "Failed to read request body");
            Rejection::UnreadableBody
        }
    })
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn reject(rejection: Rejection) -> Response<Body> {
    metrics::record_admission(rejection.stage(), "rejected");
    let mut response = rejection.into_response();
    apply_security_headers(response.headers_mut());
    response
}

// =============================================================================
// Tower Layer / Service
// =============================================================================

#[derive(Clone)]
pub struct AdmissionLayer {
    pipeline: Arc<Pipeline>,
}

impl AdmissionLayer {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            pipeline: self.pipeline.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    pipeline: Arc<Pipeline>,
}

impl<S> Service<Request<Body>> for AdmissionService<S>
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
        let pipeline = self.pipeline.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let started = Instant::now();
            let identity = pipeline.resolver.resolve_request(&req);
            let (mut parts, body) = req.into_parts();

            let limit = pipeline.scanner.max_payload_bytes();
            let declared = parts
                .headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            if pipeline.scanner.oversized(declared, 0).is_some() {
                warn!(ip = %identity.ip, declared = ?declared, "Declared payload too large");
                return Ok(reject(Rejection::PayloadTooLarge { limit }));
            }

            let bytes = match buffer_body(body, limit).await {
                Ok(bytes) => bytes,
                Err(rejection) => {
                    warn!(ip = %identity.ip, path = %parts.uri.path(), "Request body rejected");
                    return Ok(reject(rejection));
                }
            };

            let method = parts.method.clone();
            let path = parts.uri.path().to_string();
            let query = parts.uri.query().map(str::to_string);

            let mut ctx = StageContext {
                identity: &identity,
                method: &method,
                path: &path,
                query: query.as_deref(),
                headers: &parts.headers,
                body: &bytes,
                is_socket_upgrade: is_websocket_upgrade(&parts.headers),
                quota: None,
                deferred: None,
            };

            for stage in STAGES {
                if let Err(rejection) = pipeline.run_stage(stage, &mut ctx).await {
                    metrics::record_pipeline_duration(started.elapsed().as_secs_f64());
                    return Ok(reject(rejection));
                }
                metrics::record_admission(stage.as_str(), "admitted");
            }
            metrics::record_pipeline_duration(started.elapsed().as_secs_f64());

            let quota = ctx.quota;
            let deferred = ctx.deferred.take();

            parts.extensions.insert(identity.clone());
            let req = Request::from_parts(parts, Body::from(bytes));
            let mut response = inner.call(req).await?;

            let settled = pipeline
                .settle_deferred(deferred, response.status())
                .await;
            if let Some(decision) = settled.or(quota) {
                decision.apply_headers(response.headers_mut());
            }
            apply_security_headers(response.headers_mut());

            pipeline.observe_response(&response, &method, &path, started.elapsed());
            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_security_headers_do_not_override_handler() {
        let mut headers = HeaderMap::new();
        headers.insert("x-frame-options", HeaderValue::from_static("SAMEORIGIN"));
        apply_security_headers(&mut headers);

        assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers.len(), SECURITY_HEADERS.len());
    }

    #[test]
    fn test_rejection_status_codes() {
        let threat = Rejection::Threat(ThreatFinding::new(
            ThreatCategory::Xss,
            "query.q",
            "<script>",
        ));
        assert_eq!(threat.into_response().status(), StatusCode::BAD_REQUEST);

        let big = Rejection::PayloadTooLarge { limit: 10 };
        assert_eq!(big.into_response().status(), StatusCode::PAYLOAD_TOO_LARGE);

        let region = Rejection::RegionRestricted {
            ip: "8.8.8.8".to_string(),
            country: "US".to_string(),
        };
        assert_eq!(region.stage(), "geo");
        assert_eq!(region.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_rate_limited_body_names_policy() {
        let policy = crate::quota::RateLimitPolicy::new("login", 5, 900, 3600);
        let outcome = crate::quota::StoreOutcome {
            consumed: 6,
            blocked_for: Some(Duration::from_secs(3600)),
            window_resets_in: Duration::from_secs(900),
        };
        let rejection = Rejection::RateLimited {
            policy: policy.name.clone(),
            decision: QuotaDecision::from_consume(&policy, &outcome, false),
        };
        assert_eq!(rejection.stage(), "quota");

        let response = rejection.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "3600");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["details"]["policy"], "login");
        assert_eq!(body["details"]["retryAfter"], 3600);
    }

    #[test]
    fn test_oversized_finding_maps_to_413() {
        let finding = ThreatFinding::new(ThreatCategory::OversizedPayload, "body", "11 bytes");
        assert!(matches!(
            Rejection::from_finding(finding, 10),
            Rejection::PayloadTooLarge { limit: 10 }
        ));
    }

    #[test]
    fn test_websocket_upgrade_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(STAGES, [Stage::Threat, Stage::Quota, Stage::Geo]);
    }
}
