//! Quota limiter: per-call store selection with local fallback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::health::{CircuitState, StoreHealth, StoreHealthConfig};
use super::local::LocalQuotaStore;
use super::store::{QuotaStore, StoreError, StoreOutcome, WindowLimits};
use super::{PolicyRegistry, QuotaDecision, RateLimitKey, RateLimitPolicy};
use crate::metrics;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("unknown rate limit policy '{0}'")]
    UnknownPolicy(String),

    #[error("shared quota store error: {0}")]
    Store(#[from] StoreError),
}

/// Snapshot of the limiter's backing stores, for health output.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    /// `redis` or `local`.
    pub backend: &'static str,
    pub circuit: CircuitState,
    /// True while calls are being answered by the local store instead of the
    /// configured shared store.
    pub degraded: bool,
    pub local_entries: usize,
    pub times_opened: u32,
}

/// Why a call was answered by the local store.
#[derive(Debug, Clone, Copy)]
enum Fallback {
    CircuitOpen,
    Timeout,
    Error,
}

impl Fallback {
    fn as_str(self) -> &'static str {
        match self {
            Fallback::CircuitOpen => "circuit_open",
            Fallback::Timeout => "timeout",
            Fallback::Error => "error",
        }
    }
}

pub struct QuotaLimiter {
    registry: Arc<PolicyRegistry>,
    shared: Option<Arc<dyn QuotaStore>>,
    local: Arc<LocalQuotaStore>,
    health: StoreHealth,
    store_timeout: Duration,
}

impl QuotaLimiter {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        shared: Option<Arc<dyn QuotaStore>>,
        health: StoreHealthConfig,
        store_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            shared,
            local: Arc::new(LocalQuotaStore::new()),
            health: StoreHealth::new(health),
            store_timeout,
        }
    }

    /// Limiter without a shared store.
    pub fn local_only(registry: Arc<PolicyRegistry>) -> Self {
        Self::new(
            registry,
            None,
            StoreHealthConfig::default(),
            Duration::from_millis(50),
        )
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn local_store(&self) -> &LocalQuotaStore {
        &self.local
    }

    fn policy(&self, name: &str) -> Result<&RateLimitPolicy, QuotaError> {
        self.registry
            .get(name)
            .ok_or_else(|| QuotaError::UnknownPolicy(name.to_string()))
    }

    /// Consume one unit for `key` under `policy_name`.
    ///
    /// Never fails because of the shared store: errors, timeouts and an open
    /// breaker all fall back to the local store with `degraded = true`.
    ///
    /// # Errors
    ///
    /// `QuotaError::UnknownPolicy` if `policy_name` is not registered.
    pub async fn check(
        &self,
        policy_name: &str,
        key: &RateLimitKey,
    ) -> Result<QuotaDecision, QuotaError> {
        let policy = self.policy(policy_name)?;
        let storage_key = key.storage_key(&policy.key_prefix);
        let limits = WindowLimits::from(policy);

        let (outcome, degraded) = match self.shared_consume(&storage_key, limits).await {
            Some(Ok(outcome)) => (outcome, false),
            Some(Err(reason)) => {
                self.log_fallback(reason, &storage_key);
                (self.local.consume_now(&storage_key, &limits), true)
            }
            None => (self.local.consume_now(&storage_key, &limits), false),
        };

        let decision = QuotaDecision::from_consume(policy, &outcome, degraded);
        metrics::record_quota_decision(&policy.name, decision.allowed, degraded);
        Ok(decision)
    }

    /// Observe the quota for `key` without consuming.
    ///
    /// # Errors
    ///
    /// `QuotaError::UnknownPolicy` if `policy_name` is not registered.
    pub async fn peek(
        &self,
        policy_name: &str,
        key: &RateLimitKey,
    ) -> Result<QuotaDecision, QuotaError> {
        let policy = self.policy(policy_name)?;
        let storage_key = key.storage_key(&policy.key_prefix);

        let (outcome, degraded) = match self.shared_peek(&storage_key).await {
            Some(Ok(outcome)) => (outcome, false),
            Some(Err(reason)) => {
                self.log_fallback(reason, &storage_key);
                (self.local.peek_now(&storage_key), true)
            }
            None => (self.local.peek_now(&storage_key), false),
        };

        Ok(QuotaDecision::from_peek(policy, &outcome, degraded))
    }

    /// Clear the counter and any block for `key`, in both stores.
    ///
    /// # Errors
    ///
    /// `UnknownPolicy`, or `Store` if the shared store rejected the reset.
    pub async fn reset(&self, policy_name: &str, key: &RateLimitKey) -> Result<(), QuotaError> {
        let policy = self.policy(policy_name)?;
        let storage_key = key.storage_key(&policy.key_prefix);

        self.local.reset_now(&storage_key);

        if let Some(shared) = &self.shared {
            match tokio::time::timeout(self.store_timeout, shared.reset(&storage_key)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(StoreError::Unavailable("reset timed out".to_string()).into());
                }
            }
        }

        debug!(key = %storage_key, "Quota reset");
        Ok(())
    }

    /// Purge expired local entries. Called by the background sweeper.
    pub fn sweep_local(&self) -> usize {
        let removed = self.local.sweep();
        metrics::set_local_quota_entries(self.local.len());
        removed
    }

    pub async fn status(&self) -> StoreStatus {
        let circuit = self.health.state();
        StoreStatus {
            backend: self.shared.as_ref().map_or("local", |s| s.name()),
            circuit,
            degraded: self.shared.is_some() && circuit != CircuitState::Closed,
            local_entries: self.local.len(),
            times_opened: self.health.times_opened(),
        }
    }

    /// Ping the shared store, bypassing the breaker.
    pub async fn ping_shared(&self) -> Option<Result<(), StoreError>> {
        let shared = self.shared.as_ref()?;
        Some(
            match tokio::time::timeout(self.store_timeout, shared.ping()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Unavailable("ping timed out".to_string())),
            },
        )
    }

    /// `None` when no shared store is configured.
    ///
    /// The increment runs on its own task so that dropping the request future
    /// (client disconnect) cannot cancel it halfway.
    async fn shared_consume(
        &self,
        storage_key: &str,
        limits: WindowLimits,
    ) -> Option<Result<StoreOutcome, Fallback>> {
        let shared = self.shared.clone()?;
        if !self.health.allow_request().await {
            return Some(Err(Fallback::CircuitOpen));
        }

        let key = storage_key.to_string();
        let timeout = self.store_timeout;
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            tokio::time::timeout(timeout, shared.consume(&key, &limits)).await
        });

        let result = match handle.await {
            Ok(Ok(Ok(outcome))) => Ok(outcome),
            Ok(Ok(Err(e))) => {
                debug!(error = %e, "Shared quota store consume failed");
                Err(Fallback::Error)
            }
            Ok(Err(_elapsed)) => Err(Fallback::Timeout),
            Err(join_error) => {
                debug!(error = %join_error, "Shared quota store task failed");
                Err(Fallback::Error)
            }
        };
        metrics::record_store_duration("consume", started.elapsed().as_secs_f64());
        self.record_health(&result).await;
        Some(result)
    }

    async fn shared_peek(&self, storage_key: &str) -> Option<Result<StoreOutcome, Fallback>> {
        let shared = self.shared.as_ref()?;
        if !self.health.allow_request().await {
            return Some(Err(Fallback::CircuitOpen));
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(self.store_timeout, shared.peek(storage_key)).await
        {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => {
                debug!(error = %e, "Shared quota store peek failed");
                Err(Fallback::Error)
            }
            Err(_) => Err(Fallback::Timeout),
        };
        metrics::record_store_duration("peek", started.elapsed().as_secs_f64());
        self.record_health(&result).await;
        Some(result)
    }

    async fn record_health(&self, result: &Result<StoreOutcome, Fallback>) {
        match result {
            Ok(_) => self.health.record_success().await,
            Err(_) => self.health.record_failure().await,
        }
    }

    fn log_fallback(&self, reason: Fallback, storage_key: &str) {
        metrics::record_store_fallback(reason.as_str());
        match reason {
            // Logged once on transition by the breaker
            Fallback::CircuitOpen => debug!(key = %storage_key, "Quota served locally, breaker open"),
            Fallback::Timeout | Fallback::Error => warn!(
                key = %storage_key,
                reason = reason.as_str(),
                timeout_ms = u64::try_from(self.store_timeout.as_millis()).unwrap_or(u64::MAX),
                "Shared quota store unavailable, served from local store"
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::quota::{RateLimitPolicy, RouteRule};
    use async_trait::async_trait;
    use axum::http::Method;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Shared store that delegates to a local store until switched off.
    struct FlakyStore {
        inner: LocalQuotaStore,
        down: AtomicBool,
    }

    #[async_trait]
    impl QuotaStore for FlakyStore {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn consume(
            &self,
            key: &str,
            limits: &WindowLimits,
        ) -> Result<StoreOutcome, StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            self.inner.consume(key, limits).await
        }

        async fn peek(&self, key: &str) -> Result<StoreOutcome, StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            self.inner.peek(key).await
        }

        async fn reset(&self, key: &str) -> Result<(), StoreError> {
            self.inner.reset(key).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn registry() -> Arc<PolicyRegistry> {
        Arc::new(
            PolicyRegistry::new(
                vec![RateLimitPolicy::new("tiny", 2, 60, 30)],
                vec![RouteRule::new("/", &[], "tiny")],
            )
            .unwrap(),
        )
    }

    fn key(ip: &str) -> RateLimitKey {
        RateLimitKey::new("tiny", ip, &Method::GET, "/things")
    }

    #[tokio::test]
    async fn test_local_only_is_not_degraded() {
        let limiter = QuotaLimiter::local_only(registry());
        let decision = limiter.check("tiny", &key("10.0.0.1")).await.unwrap();
        assert!(decision.allowed);
        assert!(!decision.degraded);
        assert_eq!(decision.remaining, 1);

        let status = limiter.status().await;
        assert_eq!(status.backend, "local");
        assert!(!status.degraded);
    }

    #[tokio::test]
    async fn test_unknown_policy() {
        let limiter = QuotaLimiter::local_only(registry());
        let err = limiter.check("nope", &key("10.0.0.1")).await.unwrap_err();
        assert!(matches!(err, QuotaError::UnknownPolicy(_)));
    }

    #[tokio::test]
    async fn test_falls_back_when_shared_store_fails() {
        let store = Arc::new(FlakyStore {
            inner: LocalQuotaStore::new(),
            down: AtomicBool::new(true),
        });
        let limiter = QuotaLimiter::new(
            registry(),
            Some(store),
            StoreHealthConfig::default(),
            Duration::from_millis(50),
        );

        let k = key("10.0.0.2");
        let first = limiter.check("tiny", &k).await.unwrap();
        assert!(first.allowed && first.degraded);
        assert!(limiter.check("tiny", &k).await.unwrap().allowed);

        let third = limiter.check("tiny", &k).await.unwrap();
        assert!(!third.allowed);
        assert!(third.degraded);
        assert_eq!(third.retry_after_secs(), 30);
    }

    #[tokio::test]
    async fn test_peek_then_reset() {
        let limiter = QuotaLimiter::local_only(registry());
        let k = key("10.0.0.3");
        for _ in 0..3 {
            limiter.check("tiny", &k).await.unwrap();
        }
        assert!(!limiter.peek("tiny", &k).await.unwrap().allowed);

        limiter.reset("tiny", &k).await.unwrap();
        let after = limiter.peek("tiny", &k).await.unwrap();
        assert!(after.allowed);
        assert_eq!(after.remaining, 2);
    }
}
