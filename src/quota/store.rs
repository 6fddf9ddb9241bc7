//! Counter store abstraction shared by the Redis and in-process backends.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::RateLimitPolicy;

/// Store failures. Never surfaced to clients; they trigger degraded mode.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store command failed: {0}")]
    Command(String),

    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

/// Per-call limits derived from a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimits {
    pub points: u64,
    pub window: Duration,
    /// Zero means "denied until the window resets".
    pub block: Duration,
}

impl From<&RateLimitPolicy> for WindowLimits {
    fn from(policy: &RateLimitPolicy) -> Self {
        Self {
            points: policy.points,
            window: Duration::from_secs(policy.window_seconds),
            block: Duration::from_secs(policy.block_seconds),
        }
    }
}

/// Counter state observed by one store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreOutcome {
    /// Units consumed in the current window.
    pub consumed: u64,
    /// Remaining penalty (or window, when the policy has no block) if denied.
    pub blocked_for: Option<Duration>,
    /// Time until the counter window expires.
    pub window_resets_in: Duration,
}

/// Atomic fixed-window counter with penalty lock.
///
/// `consume` must increment and compare in one atomic step per key. While a
/// key is blocked it must return the block without incrementing.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn consume(&self, key: &str, limits: &WindowLimits) -> Result<StoreOutcome, StoreError>;

    /// Observe state without consuming. `blocked_for` reflects an active block only.
    async fn peek(&self, key: &str) -> Result<StoreOutcome, StoreError>;

    /// Drop the counter and any block for `key`.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Key of the penalty marker paired with a counter key.
pub fn block_key(key: &str) -> String {
    format!("{key}:blocked")
}
