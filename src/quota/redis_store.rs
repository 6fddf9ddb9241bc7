//! Redis-backed shared quota store.
//!
//! Uses [`redis::aio::ConnectionManager`] for automatic reconnection. The
//! connection is established lazily on first use so that the service boots
//! even when Redis is down; calls made before Redis is reachable fail and
//! the limiter serves them from the local store.
//!
//! # Atomicity
//!
//! `consume` runs one Lua script per call. Redis executes scripts serially,
//! so increment, compare and block marking happen as one step for every
//! instance sharing the store.
//!
//! | Key | Value | TTL |
//! |-----|-------|-----|
//! | `{prefix}:{ip}:{METHOD}:{route}` | consumed count | window |
//! | `{key}:blocked` | `1` | block |

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::info;

use super::store::{QuotaStore, StoreError, StoreOutcome, WindowLimits, block_key};

/// KEYS[1] counter, KEYS[2] block marker; ARGV points, window ms, block ms.
/// Returns {consumed, blocked_ms (0 = allowed), window_ttl_ms}.
const CONSUME_SCRIPT: &str = r#"
local block_ttl = redis.call('PTTL', KEYS[2])
if block_ttl > 0 then
  local current = tonumber(redis.call('GET', KEYS[1]) or '0')
  local ttl = redis.call('PTTL', KEYS[1])
  if ttl < 0 then ttl = 0 end
  return {current, block_ttl, ttl}
end
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  ttl = tonumber(ARGV[2])
end
local blocked = 0
if count > tonumber(ARGV[1]) then
  if tonumber(ARGV[3]) > 0 then
    redis.call('SET', KEYS[2], '1', 'PX', ARGV[3])
    blocked = tonumber(ARGV[3])
  else
    blocked = ttl
  end
end
return {count, blocked, ttl}
"#;

/// Returns {consumed, block_ttl_ms, window_ttl_ms} without mutating.
const PEEK_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local block_ttl = redis.call('PTTL', KEYS[2])
if block_ttl < 0 then block_ttl = 0 end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then ttl = 0 end
return {current, block_ttl, ttl}
"#;

pub struct RedisQuotaStore {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    consume_script: Script,
    peek_script: Script,
}

impl RedisQuotaStore {
    /// Validate the URL. Does not connect.
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("Invalid Redis URL: {e}")))?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            consume_script: Script::new(CONSUME_SCRIPT),
            peek_script: Script::new(PEEK_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let conn = ConnectionManager::new(self.client.clone()).await?;
                info!("Connected to shared quota store");
                Ok::<_, StoreError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

/// Convert the script's `{consumed, blocked_ms, ttl_ms}` reply.
fn outcome_from_reply(reply: &[i64]) -> Result<StoreOutcome, StoreError> {
    let [consumed, blocked_ms, ttl_ms] = reply else {
        return Err(StoreError::Protocol(format!(
            "expected 3 integers, got {}",
            reply.len()
        )));
    };
    let millis = |v: i64| Duration::from_millis(u64::try_from(v).unwrap_or(0));

    Ok(StoreOutcome {
        consumed: u64::try_from(*consumed).unwrap_or(0),
        blocked_for: (*blocked_ms > 0).then(|| millis(*blocked_ms)),
        window_resets_in: millis(*ttl_ms),
    })
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn consume(&self, key: &str, limits: &WindowLimits) -> Result<StoreOutcome, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Vec<i64> = self
            .consume_script
            .key(key)
            .key(block_key(key))
            .arg(limits.points)
            .arg(duration_ms(limits.window).max(1))
            .arg(duration_ms(limits.block))
            .invoke_async(&mut conn)
            .await?;
        outcome_from_reply(&reply)
    }

    async fn peek(&self, key: &str) -> Result<StoreOutcome, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Vec<i64> = self
            .peek_script
            .key(key)
            .key(block_key(key))
            .invoke_async(&mut conn)
            .await?;
        outcome_from_reply(&reply)
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(key)
            .arg(block_key(key))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
