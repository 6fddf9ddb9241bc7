//! Process-local quota store.
//!
//! Used when no shared store is configured and as the degraded-mode fallback
//! when the shared store is unreachable. Semantics match the Redis script:
//! the counter window and the penalty block expire independently.
//!
//! Atomicity comes from `DashMap::entry`, which holds the shard write lock for
//! the whole read-modify-write. Time is read from `tokio::time::Instant` so
//! tests can drive windows with a paused clock.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::store::{QuotaStore, StoreError, StoreOutcome, WindowLimits};

#[derive(Debug, Clone, Copy)]
struct LocalEntry {
    consumed: u64,
    window_expires_at: Instant,
    blocked_until: Option<Instant>,
}

impl LocalEntry {
    fn window_live(&self, now: Instant) -> bool {
        self.window_expires_at > now
    }

    fn block_remaining(&self, now: Instant) -> Option<Duration> {
        self.blocked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    fn is_expired(&self, now: Instant) -> bool {
        !self.window_live(now) && self.block_remaining(now).is_none()
    }
}

#[derive(Debug, Default)]
pub struct LocalQuotaStore {
    entries: DashMap<String, LocalEntry>,
}

impl LocalQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous consume; infallible.
    pub fn consume_now(&self, key: &str, limits: &WindowLimits) -> StoreOutcome {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| LocalEntry {
                consumed: 0,
                window_expires_at: now + limits.window,
                blocked_until: None,
            });

        if let Some(remaining) = entry.block_remaining(now) {
            return StoreOutcome {
                consumed: if entry.window_live(now) { entry.consumed } else { 0 },
                blocked_for: Some(remaining),
                window_resets_in: entry.window_expires_at.saturating_duration_since(now),
            };
        }
        entry.blocked_until = None;

        if !entry.window_live(now) {
            entry.consumed = 0;
            entry.window_expires_at = now + limits.window;
        }

        entry.consumed += 1;
        let window_resets_in = entry.window_expires_at - now;

        let blocked_for = if entry.consumed > limits.points {
            if limits.block.is_zero() {
                Some(window_resets_in)
            } else {
                entry.blocked_until = Some(now + limits.block);
                Some(limits.block)
            }
        } else {
            None
        };

        StoreOutcome {
            consumed: entry.consumed,
            blocked_for,
            window_resets_in,
        }
    }

    pub fn peek_now(&self, key: &str) -> StoreOutcome {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => StoreOutcome {
                consumed: if entry.window_live(now) { entry.consumed } else { 0 },
                blocked_for: entry.block_remaining(now),
                window_resets_in: entry.window_expires_at.saturating_duration_since(now),
            },
            _ => StoreOutcome::default(),
        }
    }

    pub fn reset_now(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop entries whose window and block have both expired.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl QuotaStore for LocalQuotaStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn consume(&self, key: &str, limits: &WindowLimits) -> Result<StoreOutcome, StoreError> {
        Ok(self.consume_now(key, limits))
    }

    async fn peek(&self, key: &str) -> Result<StoreOutcome, StoreError> {
        Ok(self.peek_now(key))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.reset_now(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
