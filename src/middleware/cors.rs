//! Origin policy engine backing the CORS layer.
//!
//! The allow decision is owned by [`OriginRegistry`]; `tower_http`'s
//! [`CorsLayer`] only renders headers. The registry holds an immutable
//! [`OriginPolicy`] snapshot behind an `ArcSwap`, so the per-request check is
//! a lock-free load and admin mutations swap in a new copy.
//!
//! # Matching
//!
//! 1. No `Origin` header ⇒ allowed (same-origin or non-browser client)
//! 2. Exact string match against configured origins
//! 3. Wildcard patterns: `*` matches any run of characters, anchored on both
//!    ends, so `https://*.example.com` admits `https://app.example.com` but
//!    not `https://example.com.evil.net`
//!
//! Scheme and port are part of the origin string: `http://a.com` and
//! `https://a.com:8443` are distinct.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::http::{HeaderName, HeaderValue, Method};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;

/// Errors from origin list mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginError {
    #[error("origin must not be empty")]
    Empty,

    #[error("'*' cannot be allowed while credentials are enabled")]
    WildcardWithCredentials,

    #[error("invalid origin pattern '{0}'")]
    InvalidPattern(String),
}

/// A compiled `*` pattern.
#[derive(Debug, Clone)]
struct OriginPattern {
    raw: String,
    regex: Regex,
}

impl OriginPattern {
    fn compile(raw: &str) -> Result<Self, OriginError> {
        let escaped = raw
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{escaped}$"))
            .map_err(|_| OriginError::InvalidPattern(raw.to_string()))?;
        Ok(Self {
            raw: raw.to_string(),
            regex,
        })
    }
}

/// Immutable origin policy snapshot.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    exact: Vec<String>,
    patterns: Vec<OriginPattern>,
    pub credentials_allowed: bool,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub max_age: Duration,
}

/// Listing returned by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct OriginListing {
    pub origins: Vec<String>,
    pub credentials_allowed: bool,
}

impl OriginPolicy {
    /// Build from configuration. Fails on the same inputs the admin add rejects.
    pub fn from_config(config: &Config) -> Result<Self, OriginError> {
        let mut policy = Self {
            exact: Vec::new(),
            patterns: Vec::new(),
            credentials_allowed: config.cors_allow_credentials,
            allowed_methods: config.cors_allowed_methods.clone(),
            allowed_headers: config.cors_allowed_headers.clone(),
            exposed_headers: config.cors_exposed_headers.clone(),
            max_age: config.cors_max_age,
        };
        for origin in &config.cors_allowed_origins {
            policy.insert(origin)?;
        }
        Ok(policy)
    }

    /// Decide whether a browser origin may make cross-origin requests.
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };

        self.exact.iter().any(|o| o == origin)
            || self.patterns.iter().any(|p| p.regex.is_match(origin))
    }

    /// Add an origin. Returns `false` if it was already present.
    fn insert(&mut self, origin: &str) -> Result<bool, OriginError> {
        let origin = origin.trim();
        if origin.is_empty() {
            return Err(OriginError::Empty);
        }
        if origin == "*" && self.credentials_allowed {
            return Err(OriginError::WildcardWithCredentials);
        }

        if origin.contains('*') {
            if self.patterns.iter().any(|p| p.raw == origin) {
                return Ok(false);
            }
            self.patterns.push(OriginPattern::compile(origin)?);
        } else {
            if self.exact.iter().any(|o| o == origin) {
                return Ok(false);
            }
            self.exact.push(origin.to_string());
        }
        Ok(true)
    }

    /// Remove an origin or pattern. Returns `false` if it was absent.
    fn remove(&mut self, origin: &str) -> bool {
        let origin = origin.trim();
        let before = self.exact.len() + self.patterns.len();
        self.exact.retain(|o| o != origin);
        self.patterns.retain(|p| p.raw != origin);
        before != self.exact.len() + self.patterns.len()
    }

    pub fn listing(&self) -> OriginListing {
        OriginListing {
            origins: self
                .exact
                .iter()
                .cloned()
                .chain(self.patterns.iter().map(|p| p.raw.clone()))
                .collect(),
            credentials_allowed: self.credentials_allowed,
        }
    }
}

/// Live origin registry with copy-on-write updates.
#[derive(Debug)]
pub struct OriginRegistry {
    current: ArcSwap<OriginPolicy>,
}

impl OriginRegistry {
    pub fn new(policy: OriginPolicy) -> Self {
        Self {
            current: ArcSwap::from_pointee(policy),
        }
    }

    pub fn snapshot(&self) -> Arc<OriginPolicy> {
        self.current.load_full()
    }

    #[inline]
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        self.current.load().is_allowed(origin)
    }

    /// Add an origin (idempotent). Returns whether the list changed.
    pub fn add(&self, origin: &str) -> Result<bool, OriginError> {
        let mut outcome = Ok(false);
        self.current.rcu(|current| {
            let mut next = OriginPolicy::clone(current);
            outcome = next.insert(origin);
            next
        });
        if let Ok(true) = outcome {
            info!(origin, "CORS origin added");
        }
        outcome
    }

    /// Remove an origin (idempotent). Returns whether the list changed.
    pub fn remove(&self, origin: &str) -> bool {
        let mut removed = false;
        self.current.rcu(|current| {
            let mut next = OriginPolicy::clone(current);
            removed = next.remove(origin);
            next
        });
        if removed {
            info!(origin, "CORS origin removed");
        }
        removed
    }
}

/// Build the outer CORS layer driven by the live registry.
pub fn cors_layer(registry: Arc<OriginRegistry>) -> CorsLayer {
    let policy = registry.snapshot();

    let methods: Vec<Method> = policy
        .allowed_methods
        .iter()
        .filter_map(|m| parse_or_warn(m, "method"))
        .collect();
    let headers: Vec<HeaderName> = policy
        .allowed_headers
        .iter()
        .filter_map(|h| parse_or_warn(h, "header"))
        .collect();
    let exposed: Vec<HeaderName> = policy
        .exposed_headers
        .iter()
        .filter_map(|h| parse_or_warn(h, "exposed header"))
        .collect();

    let predicate = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        origin
            .to_str()
            .map(|o| registry.is_allowed(Some(o)))
            .unwrap_or(false)
    });

    CorsLayer::new()
        .allow_origin(predicate)
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers(exposed)
        .allow_credentials(policy.credentials_allowed)
        .max_age(policy.max_age)
}

fn parse_or_warn<T: std::str::FromStr>(raw: &str, kind: &str) -> Option<T> {
    let parsed = raw.parse().ok();
    if parsed.is_none() {
        warn!(value = raw, kind, "Skipping invalid CORS entry");
    }
    parsed
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn policy(origins: &[&str], credentials: bool) -> OriginPolicy {
        let config = Config {
            cors_allowed_origins: origins.iter().map(|s| s.to_string()).collect(),
            cors_allow_credentials: credentials,
            ..Config::default()
        };
        OriginPolicy::from_config(&config).unwrap()
    }

    #[test]
    fn test_missing_origin_allowed() {
        assert!(policy(&[], false).is_allowed(None));
    }

    #[test]
    fn test_exact_match_is_reflexive() {
        let p = policy(&["https://app.example.com"], false);
        assert!(p.is_allowed(Some("https://app.example.com")));
    }

    #[test]
    fn test_scheme_and_port_sensitive() {
        let p = policy(&["https://app.example.com"], false);
        assert!(!p.is_allowed(Some("http://app.example.com")));
        assert!(!p.is_allowed(Some("https://app.example.com:8443")));
    }

    #[test]
    fn test_wildcard_pattern_anchored() {
        let p = policy(&["https://*.example.com"], false);
        assert!(p.is_allowed(Some("https://app.example.com")));
        assert!(p.is_allowed(Some("https://a.b.example.com")));
        assert!(!p.is_allowed(Some("https://example.com.evil.net")));
        assert!(!p.is_allowed(Some("http://app.example.com")));
    }

    #[test]
    fn test_pattern_escapes_regex_metacharacters() {
        let p = policy(&["https://*.example.com"], false);
        // The dot is literal, not "any character"
        assert!(!p.is_allowed(Some("https://appXexampleYcom")));
    }

    #[test]
    fn test_star_without_credentials_allows_all() {
        let p = policy(&["*"], false);
        assert!(p.is_allowed(Some("https://anything.test")));
    }

    #[test]
    fn test_star_with_credentials_rejected() {
        let config = Config {
            cors_allowed_origins: vec!["*".to_string()],
            cors_allow_credentials: true,
            ..Config::default()
        };
        assert_eq!(
            OriginPolicy::from_config(&config).unwrap_err(),
            OriginError::WildcardWithCredentials
        );
    }

    #[test]
    fn test_registry_add_and_remove() {
        let registry = OriginRegistry::new(policy(&[], false));

        assert!(!registry.is_allowed(Some("https://new.example.com")));
        assert!(registry.add("https://new.example.com").unwrap());
        assert!(registry.is_allowed(Some("https://new.example.com")));

        // Idempotent
        assert!(!registry.add("https://new.example.com").unwrap());
        assert!(registry.remove("https://new.example.com"));
        assert!(!registry.remove("https://new.example.com"));
        assert!(!registry.is_allowed(Some("https://new.example.com")));
    }

    #[test]
    fn test_registry_add_star_with_credentials() {
        let registry = OriginRegistry::new(policy(&[], true));
        assert_eq!(
            registry.add("*").unwrap_err(),
            OriginError::WildcardWithCredentials
        );
        assert!(registry.snapshot().listing().origins.is_empty());
    }

    #[test]
    fn test_snapshot_unaffected_by_later_mutation() {
        let registry = OriginRegistry::new(policy(&["https://a.test"], false));
        let before = registry.snapshot();
        registry.add("https://b.test").unwrap();

        assert!(!before.is_allowed(Some("https://b.test")));
        assert!(registry.is_allowed(Some("https://b.test")));
    }

    #[test]
    fn test_cors_layer_builds() {
        let registry = Arc::new(OriginRegistry::new(policy(&["https://a.test"], true)));
        let _layer = cors_layer(registry);
    }
}
