//! Multi-policy quota limiting.
//!
//! # Algorithm
//!
//! Fixed-window counter with a penalty lock, not a sliding window:
//!
//! 1. While a key is blocked, every check is denied without incrementing.
//! 2. Otherwise the counter is incremented atomically, creating the window
//!    (TTL = `window_seconds`) on first use.
//! 3. If the new count exceeds `points`, the key is blocked for
//!    `block_seconds` (or, with `block_seconds = 0`, until the window resets).
//!
//! A block outlives the window that caused it and is only cleared by natural
//! expiry or an administrative reset.
//!
//! # Stores
//!
//! - [`RedisQuotaStore`]: shared across instances, atomic via a Lua script
//! - [`LocalQuotaStore`]: per process, atomic via `DashMap` entry locks
//!
//! When the shared store errors or exceeds `STORE_TIMEOUT_MS`, the
//! [`QuotaLimiter`] answers from the local store with identical semantics.
//! That trades cross-instance consistency for availability: during an outage
//! each instance enforces the quota on its own, so a client spread across N
//! instances may get up to N × `points`. Limiting is never disabled.
//!
//! # Response Headers
//!
//! - `X-RateLimit-Limit`: policy points
//! - `X-RateLimit-Remaining`: units left in the window
//! - `X-RateLimit-Reset`: seconds until quota is available again
//! - `Retry-After`: on rejection only

mod health;
mod limiter;
mod local;
mod redis_store;
mod store;

use std::collections::HashSet;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, Method};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

pub use health::{CircuitState, StoreHealth, StoreHealthConfig};
pub use limiter::{QuotaError, QuotaLimiter, StoreStatus};
pub use local::LocalQuotaStore;
pub use redis_store::RedisQuotaStore;
pub use store::{QuotaStore, StoreError, StoreOutcome, WindowLimits};

// =============================================================================
// Policies
// =============================================================================

/// Named quota policy. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub name: String,
    /// Storage key prefix; defaults to `rl:{name}`.
    #[serde(default)]
    pub key_prefix: String,
    /// Units permitted per window.
    pub points: u64,
    pub window_seconds: u64,
    /// Penalty once exhausted; 0 = denied until the window resets.
    #[serde(default)]
    pub block_seconds: u64,
    /// Only failed responses (status ≥ 400) consume units.
    #[serde(default)]
    pub counts_failures_only: bool,
}

impl RateLimitPolicy {
    pub fn new(name: &str, points: u64, window_seconds: u64, block_seconds: u64) -> Self {
        Self {
            name: name.to_string(),
            key_prefix: format!("rl:{name}"),
            points,
            window_seconds,
            block_seconds,
            counts_failures_only: false,
        }
    }

    pub fn failures_only(mut self) -> Self {
        self.counts_failures_only = true;
        self
    }

    /// Built-in presets, from most to least sensitive.
    pub fn presets() -> Vec<Self> {
        vec![
            Self::new("login", 5, 900, 3600),
            Self::new("register", 3, 3600, 3600),
            Self::new("password_reset", 3, 3600, 3600),
            Self::new("admin", 30, 60, 300),
            Self::new("upload", 20, 3600, 600),
            Self::new("search", 60, 60, 60),
            Self::new("api", 300, 60, 60),
            Self::new("bulk_read", 2000, 60, 30),
        ]
    }
}

/// Maps a path prefix (and optionally methods) to a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub path_prefix: String,
    /// Empty = any method.
    #[serde(default)]
    pub methods: Vec<String>,
    pub policy: String,
}

impl RouteRule {
    pub fn new(path_prefix: &str, methods: &[&str], policy: &str) -> Self {
        Self {
            path_prefix: path_prefix.to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            policy: policy.to_string(),
        }
    }

    /// Default rules; first match wins, `/` catches the rest.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("/api/auth/login", &["POST"], "login"),
            Self::new("/api/auth/register", &["POST"], "register"),
            Self::new("/api/auth/password-reset", &["POST"], "password_reset"),
            Self::new("/admin", &[], "admin"),
            Self::new("/api/admin", &[], "admin"),
            Self::new("/api/upload", &["POST", "PUT"], "upload"),
            Self::new("/api/search", &[], "search"),
            Self::new("/api/bulk", &["GET"], "bulk_read"),
            Self::new("/", &[], "api"),
        ]
    }

    fn matches(&self, method: &Method, path: &str) -> bool {
        let method_ok = self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.as_str()));
        method_ok && path_has_prefix(path, &self.path_prefix)
    }
}

/// Segment-aware prefix match: `/api` matches `/api` and `/api/x`, not `/apix`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Fixed registry of named policies and route rules.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: Vec<RateLimitPolicy>,
    routes: Vec<RouteRule>,
    exempt_paths: Vec<String>,
}

impl PolicyRegistry {
    /// Validate and build the registry.
    ///
    /// # Errors
    ///
    /// `AppError::ConfigError` on zero points/window, duplicate names, or a
    /// route naming an unknown policy.
    pub fn new(policies: Vec<RateLimitPolicy>, routes: Vec<RouteRule>) -> AppResult<Self> {
        if policies.is_empty() {
            return Err(AppError::ConfigError(
                "At least one rate limit policy is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut validated = Vec::with_capacity(policies.len());
        for mut policy in policies {
            if policy.points == 0 || policy.window_seconds == 0 {
                return Err(AppError::ConfigError(format!(
                    "Rate limit policy '{}' needs points > 0 and window_seconds > 0",
                    policy.name
                )));
            }
            if !seen.insert(policy.name.clone()) {
                return Err(AppError::ConfigError(format!(
                    "Duplicate rate limit policy '{}'",
                    policy.name
                )));
            }
            if policy.key_prefix.is_empty() {
                policy.key_prefix = format!("rl:{}", policy.name);
            }
            validated.push(policy);
        }

        for rule in &routes {
            if !seen.contains(&rule.policy) {
                return Err(AppError::ConfigError(format!(
                    "Route rule '{}' references unknown policy '{}'",
                    rule.path_prefix, rule.policy
                )));
            }
        }

        Ok(Self {
            policies: validated,
            routes,
            exempt_paths: Vec::new(),
        })
    }

    pub fn with_exempt_paths(mut self, exempt_paths: Vec<String>) -> Self {
        self.exempt_paths = exempt_paths;
        self
    }

    pub fn get(&self, name: &str) -> Option<&RateLimitPolicy> {
        self.policies.iter().find(|p| p.name == name)
    }

    pub fn policies(&self) -> &[RateLimitPolicy] {
        &self.policies
    }

    /// Policy governing a request, or `None` for exempt/unmatched paths.
    pub fn select(&self, method: &Method, path: &str) -> Option<&RateLimitPolicy> {
        if self.exempt_paths.iter().any(|p| p == path) {
            return None;
        }
        self.routes
            .iter()
            .find(|rule| rule.matches(method, path))
            .and_then(|rule| self.get(&rule.policy))
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Identity of one quota counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitKey {
    pub policy_name: String,
    pub client_ip: String,
    /// Normalized route pattern (see [`normalize_route`]).
    pub route: String,
    pub method: String,
}

impl RateLimitKey {
    pub fn new(policy_name: &str, client_ip: &str, method: &Method, path: &str) -> Self {
        Self {
            policy_name: policy_name.to_string(),
            client_ip: client_ip.to_string(),
            route: normalize_route(path),
            method: method.as_str().to_ascii_uppercase(),
        }
    }

    /// `{prefix}:{ip}:{METHOD}:{route}`
    pub fn storage_key(&self, prefix: &str) -> String {
        format!(
            "{prefix}:{}:{}:{}",
            self.client_ip, self.method, self.route
        )
    }
}

/// Collapse identifier segments so `/users/42` and `/users/43` share a counter.
///
/// Numeric, UUID, long hex (≥16) and long opaque token (≥20, containing a
/// digit) segments become `:id`. Empty segments and trailing slashes are
/// dropped.
pub fn normalize_route(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| if is_identifier(s) { ":id" } else { s })
        .collect();

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn is_identifier(segment: &str) -> bool {
    let all_digits = segment.chars().all(|c| c.is_ascii_digit());
    if all_digits {
        return true;
    }

    if uuid::Uuid::try_parse(segment).is_ok() {
        return true;
    }

    if segment.len() >= 16 && segment.chars().all(|c| c.is_ascii_hexdigit()) {
        return true;
    }

    segment.len() >= 20
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && segment.chars().any(|c| c.is_ascii_digit())
}

// =============================================================================
// Decisions
// =============================================================================

/// Outcome of one quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Zero when allowed.
    pub retry_after_ms: u64,
    /// Time until quota is available again.
    pub reset_after_ms: u64,
    /// Answered by the local store because the shared store failed.
    pub degraded: bool,
}

impl QuotaDecision {
    /// Decision for a consuming check.
    pub fn from_consume(policy: &RateLimitPolicy, outcome: &StoreOutcome, degraded: bool) -> Self {
        match outcome.blocked_for {
            Some(blocked) => Self::denied(policy, blocked, degraded),
            None => Self {
                allowed: true,
                limit: policy.points,
                remaining: policy.points.saturating_sub(outcome.consumed),
                retry_after_ms: 0,
                reset_after_ms: millis(outcome.window_resets_in),
                degraded,
            },
        }
    }

    /// Decision for a non-consuming pre-check: exhausted counts as denied.
    pub fn from_peek(policy: &RateLimitPolicy, outcome: &StoreOutcome, degraded: bool) -> Self {
        if let Some(blocked) = outcome.blocked_for {
            return Self::denied(policy, blocked, degraded);
        }
        if outcome.consumed >= policy.points {
            return Self::denied(policy, outcome.window_resets_in, degraded);
        }
        Self {
            allowed: true,
            limit: policy.points,
            remaining: policy.points - outcome.consumed,
            retry_after_ms: 0,
            reset_after_ms: millis(outcome.window_resets_in),
            degraded,
        }
    }

    fn denied(policy: &RateLimitPolicy, wait: Duration, degraded: bool) -> Self {
        let wait_ms = millis(wait);
        Self {
            allowed: false,
            limit: policy.points,
            remaining: 0,
            retry_after_ms: wait_ms,
            reset_after_ms: wait_ms,
            degraded,
        }
    }

    /// Whole seconds until retry, rounded up, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms.div_ceil(1000).max(1)
    }

    pub fn reset_after_secs(&self) -> u64 {
        self.reset_after_ms.div_ceil(1000)
    }

    /// Write `X-RateLimit-*` (and `Retry-After` when denied).
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset_after_secs()));
        if !self.allowed {
            headers.insert("retry-after", HeaderValue::from(self.retry_after_secs()));
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn registry() -> PolicyRegistry {
        PolicyRegistry::new(RateLimitPolicy::presets(), RouteRule::defaults())
            .unwrap()
            .with_exempt_paths(vec!["/health".to_string(), "/ready".to_string()])
    }

    #[test]
    fn test_presets_are_valid() {
        let reg = registry();
        for name in [
            "api",
            "login",
            "register",
            "password_reset",
            "upload",
            "search",
            "bulk_read",
            "admin",
        ] {
            assert!(reg.get(name).is_some(), "missing preset {name}");
        }
        assert_eq!(reg.get("login").unwrap().key_prefix, "rl:login");
    }

    #[test]
    fn test_route_selection() {
        let reg = registry();
        assert_eq!(reg.select(&Method::POST, "/api/auth/login").unwrap().name, "login");
        // Method-restricted rule falls through to the catch-all
        assert_eq!(reg.select(&Method::GET, "/api/auth/login").unwrap().name, "api");
        assert_eq!(reg.select(&Method::GET, "/api/search/products").unwrap().name, "search");
        assert_eq!(reg.select(&Method::GET, "/api/searchable").unwrap().name, "api");
        assert!(reg.select(&Method::GET, "/health").is_none());
    }

    #[test]
    fn test_registry_rejects_unknown_policy_reference() {
        let result = PolicyRegistry::new(
            vec![RateLimitPolicy::new("api", 10, 60, 0)],
            vec![RouteRule::new("/", &[], "missing")],
        );
        assert!(result.unwrap_err().to_string().contains("missing"));
    }

    #[test]
    fn test_registry_rejects_zero_points() {
        let result = PolicyRegistry::new(vec![RateLimitPolicy::new("api", 0, 60, 0)], vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn test_policy_json_defaults() {
        let policy: RateLimitPolicy =
            serde_json::from_str(r#"{"name":"custom","points":10,"window_seconds":60}"#).unwrap();
        assert_eq!(policy.block_seconds, 0);
        assert!(!policy.counts_failures_only);

        let reg = PolicyRegistry::new(vec![policy], vec![]).unwrap();
        assert_eq!(reg.get("custom").unwrap().key_prefix, "rl:custom");
    }

    #[test]
    fn test_normalize_route() {
        assert_eq!(normalize_route("/users/42"), "/users/:id");
        assert_eq!(
            normalize_route("/orders/550e8400-e29b-41d4-a716-446655440000/items"),
            "/orders/:id/items"
        );
        assert_eq!(normalize_route("/blobs/deadbeefdeadbeef01"), "/blobs/:id");
        assert_eq!(normalize_route("/t/aB3dE5fG7hJ9kL1mN3pQ5r"), "/t/:id");
        assert_eq!(normalize_route("/api/products/"), "/api/products");
        assert_eq!(normalize_route("//api//login"), "/api/login");
        assert_eq!(normalize_route("/"), "/");
        assert_eq!(normalize_route("/api/search?q=1"), "/api/search");
    }

    #[test]
    fn test_storage_key_format() {
        let key = RateLimitKey::new("login", "203.0.113.1", &Method::POST, "/api/auth/login");
        assert_eq!(
            key.storage_key("rl:login"),
            "rl:login:203.0.113.1:POST:/api/auth/login"
        );
    }

    #[test]
    fn test_decision_headers_when_denied() {
        let policy = RateLimitPolicy::new("login", 5, 900, 3600);
        let outcome = StoreOutcome {
            consumed: 6,
            blocked_for: Some(Duration::from_millis(3_599_500)),
            window_resets_in: Duration::from_secs(899),
        };
        let decision = QuotaDecision::from_consume(&policy, &outcome, false);

        let mut headers = HeaderMap::new();
        decision.apply_headers(&mut headers);

        assert!(!decision.allowed);
        assert_eq!(headers["x-ratelimit-limit"], "5");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["retry-after"], "3600");
    }

    #[test]
    fn test_decision_headers_when_allowed() {
        let policy = RateLimitPolicy::new("api", 100, 60, 60);
        let outcome = StoreOutcome {
            consumed: 1,
            blocked_for: None,
            window_resets_in: Duration::from_secs(60),
        };
        let decision = QuotaDecision::from_consume(&policy, &outcome, false);

        let mut headers = HeaderMap::new();
        decision.apply_headers(&mut headers);

        assert_eq!(decision.remaining, 99);
        assert_eq!(headers["x-ratelimit-reset"], "60");
        assert!(!headers.contains_key("retry-after"));
    }

    #[test]
    fn test_peek_decision_exhausted() {
        let policy = RateLimitPolicy::new("login", 2, 60, 0);
        let outcome = StoreOutcome {
            consumed: 2,
            blocked_for: None,
            window_resets_in: Duration::from_secs(30),
        };
        let decision = QuotaDecision::from_peek(&policy, &outcome, false);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, 30_000);
    }
}
