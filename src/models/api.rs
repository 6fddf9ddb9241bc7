use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::quota::StoreStatus;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `healthy`, or `degraded` while quotas are served from the local store
    pub status: String,
    /// Quota store backend and breaker state
    pub quota_store: StoreStatus,
    /// Whether the GeoIP range table has data
    pub geoip_loaded: bool,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

/// Body for `POST/DELETE /admin/origins`.
#[derive(Debug, Deserialize)]
pub struct OriginRequest {
    /// Exact origin (`https://app.example.com`) or wildcard pattern (`https://*.example.com`)
    pub origin: String,
}

/// Body for `POST/DELETE /admin/ip-lists/{list}`.
#[derive(Debug, Deserialize)]
pub struct IpPatternRequest {
    /// Literal IP, `*` wildcard or CIDR network
    pub pattern: String,
}

/// Body for `DELETE /admin/rate-limits`.
///
/// Identifies one counter the same way the pipeline keys it.
#[derive(Debug, Deserialize)]
pub struct QuotaResetRequest {
    pub policy: String,
    pub ip: String,
    /// Defaults to `GET`
    #[serde(default)]
    pub method: Option<String>,
    /// Request path; normalized before keying
    pub path: String,
}

/// Result of an idempotent admin write.
#[derive(Debug, Serialize)]
pub struct UpdatedResponse {
    /// False when the call was a no-op (already present / already absent)
    pub changed: bool,
    pub timestamp: DateTime<Utc>,
}

impl UpdatedResponse {
    pub fn new(changed: bool) -> Self {
        Self {
            changed,
            timestamp: Utc::now(),
        }
    }
}

/// Error frame sent on a WebSocket before closing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SocketRejection {
    pub reason: String,
    pub ip: String,
    pub country: Option<String>,
}
