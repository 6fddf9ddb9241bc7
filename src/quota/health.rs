//! Shared-store health tracking.
//!
//! A circuit breaker decides, per call, whether the shared store is tried at
//! all. While it is open every quota call goes straight to the local store,
//! so an outage costs one timeout per retry interval instead of one per
//! request.
//!
//! ```text
//!   ┌─────────┐  failures ≥ threshold   ┌─────────┐
//!   │ Closed  │ ──────────────────────► │  Open   │  (local store only)
//!   └────┬────┘                         └────┬────┘
//!        ▲                                   │ retry interval elapsed
//!        │ success                           ▼
//!        │                            ┌─────────────┐
//!        └─────────────────────────── │  HalfOpen   │ ── failure ──► Open
//!                                     └─────────────┘
//! ```

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Shared store in use.
    Closed,
    /// Shared store skipped.
    Open,
    /// Probing the shared store.
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }

    fn from_gauge(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreHealthConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before it closes.
    pub success_threshold: u32,
    /// How long the shared store is skipped once open.
    pub retry_interval: Duration,
}

impl Default for StoreHealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            retry_interval: Duration::from_secs(10),
        }
    }
}

/// Transition bookkeeping, only touched while leaving the closed state.
struct Transitions {
    opened_at: Option<Instant>,
    consecutive_successes: u32,
}

/// Circuit breaker for the shared store.
///
/// The closed state is served from atomics alone: admitted requests never
/// take the lock. The lock guards state transitions. In the half-open state a
/// single caller at a time is let through as the probe; a probe that never
/// reports back is reclaimed after `retry_interval`.
pub struct StoreHealth {
    config: StoreHealthConfig,
    /// `CircuitState` as its gauge value; written under `transitions`.
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    transitions: RwLock<Transitions>,
    /// Millis since `epoch` when the current probe was claimed, 0 when free.
    probe_claimed_at: AtomicU64,
    epoch: Instant,
    times_opened: AtomicU32,
    calls_skipped: AtomicU64,
}

impl StoreHealth {
    pub fn new(config: StoreHealthConfig) -> Self {
        Self {
            config: StoreHealthConfig {
                failure_threshold: config.failure_threshold.max(1),
                success_threshold: config.success_threshold.max(1),
                ..config
            },
            state: AtomicU8::new(CircuitState::Closed.gauge_value()),
            consecutive_failures: AtomicU32::new(0),
            transitions: RwLock::new(Transitions {
                opened_at: None,
                consecutive_successes: 0,
            }),
            probe_claimed_at: AtomicU64::new(0),
            epoch: Instant::now(),
            times_opened: AtomicU32::new(0),
            calls_skipped: AtomicU64::new(0),
        }
    }

    /// Whether this call should try the shared store.
    pub async fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => self.claim_probe(),
            CircuitState::Open => self.try_half_open().await,
        }
    }

    async fn try_half_open(&self) -> bool {
        {
            let transitions = self.transitions.read().await;
            if let Some(opened_at) = transitions.opened_at
                && opened_at.elapsed() < self.config.retry_interval
            {
                self.calls_skipped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        let mut transitions = self.transitions.write().await;

        // Another task may have transitioned while we waited for the lock
        match self.state() {
            CircuitState::Open => {
                if let Some(opened_at) = transitions.opened_at
                    && opened_at.elapsed() < self.config.retry_interval
                {
                    self.calls_skipped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                transitions.consecutive_successes = 0;
                self.set_state(CircuitState::HalfOpen);
                self.probe_claimed_at.store(self.now_ms(), Ordering::Release);
                info!("Shared quota store breaker half-open, probing");
                true
            }
            CircuitState::HalfOpen => self.claim_probe(),
            CircuitState::Closed => true,
        }
    }

    fn claim_probe(&self) -> bool {
        let now = self.now_ms();
        let claimed = self.probe_claimed_at.load(Ordering::Acquire);
        let stale = claimed != 0 && now.saturating_sub(claimed) >= self.retry_interval_ms();
        if (claimed == 0 || stale)
            && self
                .probe_claimed_at
                .compare_exchange(claimed, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return true;
        }
        self.calls_skipped.fetch_add(1, Ordering::Relaxed);
        false
    }

    pub async fn record_success(&self) {
        if self.state() == CircuitState::Closed {
            if self.consecutive_failures.load(Ordering::Relaxed) != 0 {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            return;
        }

        let mut transitions = self.transitions.write().await;
        match self.state() {
            CircuitState::HalfOpen => {
                transitions.consecutive_successes += 1;
                if transitions.consecutive_successes >= self.config.success_threshold {
                    transitions.opened_at = None;
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    self.set_state(CircuitState::Closed);
                    info!("Shared quota store recovered, leaving degraded mode");
                }
                self.probe_claimed_at.store(0, Ordering::Release);
            }
            // A call admitted before the breaker opened finished late
            CircuitState::Open => debug!("Late shared-store success while open"),
            CircuitState::Closed => {}
        }
    }

    pub async fn record_failure(&self) {
        if self.state() == CircuitState::Closed {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures < self.config.failure_threshold {
                return;
            }
        }

        let mut transitions = self.transitions.write().await;
        match self.state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.load(Ordering::Relaxed);
                if failures >= self.config.failure_threshold {
                    self.open(&mut transitions);
                    warn!(
                        failures,
                        retry_interval = ?self.config.retry_interval,
                        "Shared quota store unavailable, entering degraded mode"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.open(&mut transitions);
                warn!("Shared quota store probe failed, staying in degraded mode");
            }
            CircuitState::Open => transitions.opened_at = Some(Instant::now()),
        }
    }

    fn open(&self, transitions: &mut Transitions) {
        transitions.opened_at = Some(Instant::now());
        transitions.consecutive_successes = 0;
        self.probe_claimed_at.store(0, Ordering::Release);
        self.set_state(CircuitState::Open);
        self.times_opened.fetch_add(1, Ordering::Relaxed);
        metrics::record_store_circuit_open();
    }

    fn set_state(&self, state: CircuitState) {
        self.state.store(state.gauge_value(), Ordering::Release);
        metrics::set_store_circuit_state(state.gauge_value());
    }

    fn now_ms(&self) -> u64 {
        // Never 0, which marks a free probe slot
        u64::try_from(self.epoch.elapsed().as_millis())
            .unwrap_or(u64::MAX)
            .max(1)
    }

    fn retry_interval_ms(&self) -> u64 {
        u64::try_from(self.config.retry_interval.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_gauge(self.state.load(Ordering::Acquire))
    }

    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    pub fn calls_skipped(&self) -> u64 {
        self.calls_skipped.load(Ordering::Relaxed)
    }
}

impl Default for StoreHealth {
    fn default() -> Self {
        Self::new(StoreHealthConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn health(failures: u32, retry_secs: u64) -> StoreHealth {
        StoreHealth::new(StoreHealthConfig {
            failure_threshold: failures,
            success_threshold: 1,
            retry_interval: Duration::from_secs(retry_secs),
        })
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let h = StoreHealth::default();
        assert_eq!(h.state(), CircuitState::Closed);
        assert!(h.allow_request().await);
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let h = health(3, 10);
        h.record_failure().await;
        h.record_failure().await;
        assert_eq!(h.state(), CircuitState::Closed);

        h.record_failure().await;
        assert_eq!(h.state(), CircuitState::Open);
        assert_eq!(h.times_opened(), 1);
        assert!(!h.allow_request().await);
        assert_eq!(h.calls_skipped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_retry_interval() {
        let h = health(1, 10);
        h.record_failure().await;

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(h.allow_request().await);
        assert_eq!(h.state(), CircuitState::HalfOpen);

        h.record_success().await;
        assert_eq!(h.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens() {
        let h = health(1, 10);
        h.record_failure().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(h.allow_request().await);

        h.record_failure().await;
        assert_eq!(h.state(), CircuitState::Open);
        assert_eq!(h.times_opened(), 2);
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter() {
        let h = health(2, 10);
        h.record_failure().await;
        h.record_success().await;
        h.record_failure().await;
        assert_eq!(h.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_a_single_probe() {
        let h = health(1, 10);
        h.record_failure().await;
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(h.allow_request().await);
        assert!(!h.allow_request().await);
        assert!(!h.allow_request().await);
        assert_eq!(h.state(), CircuitState::HalfOpen);

        h.record_success().await;
        assert_eq!(h.state(), CircuitState::Closed);
        assert!(h.allow_request().await);
        assert!(h.allow_request().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_is_reclaimed() {
        let h = health(1, 10);
        h.record_failure().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(h.allow_request().await);

        // The probing caller never reports back
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!h.allow_request().await);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(h.allow_request().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_open_once() {
        let h = std::sync::Arc::new(health(5, 60));
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let h = h.clone();
            tasks.push(tokio::spawn(async move { h.record_failure().await }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(h.state(), CircuitState::Open);
        assert_eq!(h.times_opened(), 1);
    }
}
