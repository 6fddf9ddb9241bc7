//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Startup Validation
//!
//! `Config::from_env()` refuses to boot on settings that would otherwise fail
//! per request, most notably `CORS_ALLOW_CREDENTIALS=true` combined with a
//! literal `*` origin, unparsable exclusion patterns, and empty quota policies.
//!
//! # Shared Store
//!
//! - `REDIS_URL`: Shared counter store. When unset, quotas are tracked per
//!   process only (the same code path used in degraded mode).
//! - `STORE_TIMEOUT_MS`: Upper bound for one shared-store round trip (default: 50)

use std::env;
use std::time::Duration;

use regex::Regex;

use crate::error::{AppError, AppResult};
use crate::quota::{PolicyRegistry, RateLimitPolicy, RouteRule};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    // =========================================================================
    // Shared Store Configuration
    // =========================================================================
    /// Redis connection string for the shared quota store (None = local only)
    pub redis_url: Option<String>,

    /// Timeout for a single shared-store round trip (default: 50ms)
    pub store_timeout: Duration,

    /// Consecutive store failures before calls skip the shared store (default: 3)
    pub store_failure_threshold: u32,

    /// How long the shared store is skipped after it trips (default: 10s)
    pub store_retry_interval: Duration,

    /// Interval for purging expired local quota entries (default: 60s)
    pub local_sweep_interval: Duration,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Named quota policies (presets, optionally overridden by `RATE_LIMIT_POLICIES`)
    pub rate_limit_policies: Vec<RateLimitPolicy>,

    /// Ordered route rules mapping paths to policies
    pub rate_limit_routes: Vec<RouteRule>,

    /// Paths never subject to quotas
    pub rate_limit_exempt_paths: Vec<String>,

    // =========================================================================
    // CORS Configuration
    // =========================================================================
    /// Allowed origins (exact values or `*` wildcard patterns)
    pub cors_allowed_origins: Vec<String>,

    /// Whether credentialed cross-origin requests are permitted
    pub cors_allow_credentials: bool,

    /// Methods returned on preflight
    pub cors_allowed_methods: Vec<String>,

    /// Request headers returned on preflight
    pub cors_allowed_headers: Vec<String>,

    /// Response headers exposed to browsers
    pub cors_exposed_headers: Vec<String>,

    /// Preflight cache lifetime
    pub cors_max_age: Duration,

    // =========================================================================
    // Client Identity Configuration
    // =========================================================================
    /// Trusted proxy CIDR ranges.
    ///
    /// When set, forwarding headers are only honoured if the socket peer lies
    /// inside one of these networks.
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Threat Scanner Configuration
    // =========================================================================
    /// Maximum request payload in bytes (default: 10MB)
    pub max_payload_bytes: usize,

    /// Maximum flattened parameter count across query and body (default: 200)
    pub max_param_count: usize,

    /// Reject requests with a missing or very short User-Agent (default: false)
    pub reject_missing_user_agent: bool,

    // =========================================================================
    // Geo Gate Configuration
    // =========================================================================
    /// Default for the `geo_restriction_enabled` setting
    pub geo_restriction_enabled: bool,

    /// Default for the `geo_allowed_country` setting (ISO-3166 alpha-2)
    pub geo_allowed_country: String,

    /// IP allow-list patterns seeded at startup
    pub geo_allowed_ips: Vec<String>,

    /// Regex patterns for paths that bypass the gate
    pub geo_excluded_paths: Vec<String>,

    /// Path to the IP range → country CSV table
    pub geoip_database_path: Option<String>,

    // =========================================================================
    // Settings Collaborator
    // =========================================================================
    /// Optional JSON settings file consumed read-only
    pub settings_path: Option<String>,

    /// Reload interval for the settings file (default: 30s)
    pub settings_refresh_interval: Duration,

    // =========================================================================
    // Administrative Surface
    // =========================================================================
    /// Admin API key (None = admin routes not mounted)
    pub admin_api_key: Option<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Responses slower than this are logged (default: 1000ms)
    pub slow_response_threshold: Duration,

    /// Responses larger than this are logged (default: 1MB)
    pub large_response_bytes: u64,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any configuration is invalid.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or(defaults.host),
            port: Self::parse_env("PORT", defaults.port)?,

            // Shared store
            redis_url: env::var("REDIS_URL").ok().filter(|u| !u.is_empty()),
            store_timeout: Duration::from_millis(Self::parse_env("STORE_TIMEOUT_MS", 50)?),
            store_failure_threshold: Self::parse_env("STORE_FAILURE_THRESHOLD", 3)?,
            store_retry_interval: Duration::from_secs(Self::parse_env(
                "STORE_RETRY_INTERVAL_SECS",
                10,
            )?),
            local_sweep_interval: Duration::from_secs(Self::parse_env(
                "LOCAL_SWEEP_INTERVAL_SECS",
                60,
            )?),

            // Rate limiting
            rate_limit_policies: Self::parse_policies(defaults.rate_limit_policies)?,
            rate_limit_routes: Self::parse_json_env("RATE_LIMIT_ROUTES")?
                .unwrap_or(defaults.rate_limit_routes),
            rate_limit_exempt_paths: Self::parse_list_env("RATE_LIMIT_EXEMPT_PATHS")
                .unwrap_or(defaults.rate_limit_exempt_paths),

            // CORS
            cors_allowed_origins: Self::parse_list_env("CORS_ALLOWED_ORIGINS")
                .unwrap_or(defaults.cors_allowed_origins),
            cors_allow_credentials: Self::parse_env("CORS_ALLOW_CREDENTIALS", false)?,
            cors_allowed_methods: Self::parse_list_env("CORS_ALLOWED_METHODS")
                .unwrap_or(defaults.cors_allowed_methods),
            cors_allowed_headers: Self::parse_list_env("CORS_ALLOWED_HEADERS")
                .unwrap_or(defaults.cors_allowed_headers),
            cors_exposed_headers: Self::parse_list_env("CORS_EXPOSED_HEADERS")
                .unwrap_or(defaults.cors_exposed_headers),
            cors_max_age: Duration::from_secs(Self::parse_env("CORS_MAX_AGE_SECS", 600)?),

            // Client identity
            trusted_proxies: Self::parse_list_env("TRUSTED_PROXIES").unwrap_or_default(),

            // Threat scanner
            max_payload_bytes: Self::parse_env("MAX_PAYLOAD_BYTES", defaults.max_payload_bytes)?,
            max_param_count: Self::parse_env("MAX_PARAM_COUNT", defaults.max_param_count)?,
            reject_missing_user_agent: Self::parse_env("REJECT_MISSING_USER_AGENT", false)?,

            // Geo gate
            geo_restriction_enabled: Self::parse_env("GEO_RESTRICTION_ENABLED", false)?,
            geo_allowed_country: env::var("GEO_ALLOWED_COUNTRY")
                .map(|c| c.trim().to_ascii_uppercase())
                .unwrap_or(defaults.geo_allowed_country),
            geo_allowed_ips: Self::parse_list_env("GEO_ALLOWED_IPS").unwrap_or_default(),
            geo_excluded_paths: Self::parse_list_env("GEO_EXCLUDED_PATHS")
                .unwrap_or(defaults.geo_excluded_paths),
            geoip_database_path: env::var("GEOIP_DATABASE_PATH")
                .ok()
                .filter(|p| !p.is_empty()),

            // Settings collaborator
            settings_path: env::var("SETTINGS_PATH").ok().filter(|p| !p.is_empty()),
            settings_refresh_interval: Duration::from_secs(Self::parse_env(
                "SETTINGS_REFRESH_SECS",
                30,
            )?),

            // Admin
            admin_api_key: env::var("ADMIN_API_KEY").ok().filter(|k| !k.is_empty()),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
            slow_response_threshold: Duration::from_millis(Self::parse_env(
                "SLOW_RESPONSE_MS",
                1000,
            )?),
            large_response_bytes: Self::parse_env(
                "LARGE_RESPONSE_BYTES",
                defaults.large_response_bytes,
            )?,
            metrics_port: Self::parse_env("METRICS_PORT", defaults.metrics_port)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.cors_allow_credentials && self.cors_allowed_origins.iter().any(|o| o == "*") {
            return Err(AppError::ConfigError(
                "CORS_ALLOW_CREDENTIALS=true cannot be combined with a '*' origin in \
                 CORS_ALLOWED_ORIGINS"
                    .to_string(),
            ));
        }

        if self.store_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "STORE_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.max_payload_bytes == 0 {
            return Err(AppError::ConfigError(
                "MAX_PAYLOAD_BYTES must be greater than 0".to_string(),
            ));
        }

        if self.max_param_count == 0 {
            return Err(AppError::ConfigError(
                "MAX_PARAM_COUNT must be greater than 0".to_string(),
            ));
        }

        if self.geo_allowed_country.len() != 2
            || !self.geo_allowed_country.chars().all(|c| c.is_ascii_alphabetic())
        {
            return Err(AppError::ConfigError(format!(
                "GEO_ALLOWED_COUNTRY must be an ISO-3166 alpha-2 code, got '{}'",
                self.geo_allowed_country
            )));
        }

        for pattern in &self.geo_excluded_paths {
            Regex::new(pattern).map_err(|e| {
                AppError::ConfigError(format!("Invalid GEO_EXCLUDED_PATHS pattern '{pattern}': {e}"))
            })?;
        }

        // Policy registry validates points/windows and route references
        PolicyRegistry::new(self.rate_limit_policies.clone(), self.rate_limit_routes.clone())?;

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if the administrative API is enabled.
    pub fn admin_enabled(&self) -> bool {
        self.admin_api_key.is_some()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a comma-separated environment variable. `None` when unset.
    fn parse_list_env(name: &str) -> Option<Vec<String>> {
        env::var(name).ok().map(|raw| split_list(&raw))
    }

    /// Parse a JSON-valued environment variable. `None` when unset.
    fn parse_json_env<T: serde::de::DeserializeOwned>(name: &str) -> AppResult<Option<T>> {
        match env::var(name) {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            _ => Ok(None),
        }
    }

    /// Merge `RATE_LIMIT_POLICIES` overrides into the presets by name.
    fn parse_policies(presets: Vec<RateLimitPolicy>) -> AppResult<Vec<RateLimitPolicy>> {
        let overrides: Vec<RateLimitPolicy> =
            Self::parse_json_env("RATE_LIMIT_POLICIES")?.unwrap_or_default();

        let mut merged = presets;
        for policy in overrides {
            match merged.iter_mut().find(|p| p.name == policy.name) {
                Some(existing) => *existing = policy,
                None => merged.push(policy),
            }
        }
        Ok(merged)
    }
}

/// Split a comma-separated list, trimming entries and dropping empties.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            // Shared store
            redis_url: None,
            store_timeout: Duration::from_millis(50),
            store_failure_threshold: 3,
            store_retry_interval: Duration::from_secs(10),
            local_sweep_interval: Duration::from_secs(60),
            // Rate limiting
            rate_limit_policies: RateLimitPolicy::presets(),
            rate_limit_routes: RouteRule::defaults(),
            rate_limit_exempt_paths: vec!["/health".to_string(), "/ready".to_string()],
            // CORS
            cors_allowed_origins: vec!["http://localhost:3000".to_string()],
            cors_allow_credentials: false,
            cors_allowed_methods: split_list("GET,POST,PUT,PATCH,DELETE,OPTIONS"),
            cors_allowed_headers: split_list(
                "content-type,authorization,x-requested-with,x-request-id,x-admin-key",
            ),
            cors_exposed_headers: split_list(
                "x-ratelimit-limit,x-ratelimit-remaining,x-ratelimit-reset,retry-after,x-request-id",
            ),
            cors_max_age: Duration::from_secs(600),
            // Client identity
            trusted_proxies: vec![],
            // Threat scanner
            max_payload_bytes: 10 * 1024 * 1024, // 10MB
            max_param_count: 200,
            reject_missing_user_agent: false,
            // Geo gate
            geo_restriction_enabled: false,
            geo_allowed_country: "YE".to_string(),
            geo_allowed_ips: vec![],
            geo_excluded_paths: vec![
                r"^/admin(/|$)".to_string(),
                r"^/api/admin(/|$)".to_string(),
                r"^/api/auth/(login|refresh|logout)$".to_string(),
                r"^/(health|ready)$".to_string(),
                r"^/(docs|api-docs)(/|$)".to_string(),
            ],
            geoip_database_path: None,
            // Settings collaborator
            settings_path: None,
            settings_refresh_interval: Duration::from_secs(30),
            // Admin
            admin_api_key: None,
            // Observability
            log_level: "info".to_string(),
            slow_response_threshold: Duration::from_millis(1000),
            large_response_bytes: 1024 * 1024,
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert!(config.redis_url.is_none());
        assert_eq!(config.max_payload_bytes, 10 * 1024 * 1024);
        assert_eq!(config.geo_allowed_country, "YE");
        assert!(!config.admin_enabled());
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "localhost".to_string(),
            port: 8080,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "localhost:8080");
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_credentials_with_wildcard_origin() {
        let config = Config {
            cors_allowed_origins: vec!["*".to_string()],
            cors_allow_credentials: true,
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("CORS_ALLOW_CREDENTIALS")
        );
    }

    #[test]
    fn test_validate_wildcard_origin_without_credentials() {
        let config = Config {
            cors_allowed_origins: vec!["*".to_string()],
            cors_allow_credentials: false,
            ..Config::default()
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_credentials_with_subdomain_pattern() {
        // Pattern wildcards are not the literal "*" origin
        let config = Config {
            cors_allowed_origins: vec!["https://*.example.com".to_string()],
            cors_allow_credentials: true,
            ..Config::default()
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_exclusion_regex() {
        let config = Config {
            geo_excluded_paths: vec!["^/admin(".to_string()],
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("GEO_EXCLUDED_PATHS"));
    }

    #[test]
    fn test_validate_country_code() {
        let config = Config {
            geo_allowed_country: "YEM".to_string(),
            ..Config::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_store_timeout() {
        let config = Config {
            store_timeout: Duration::ZERO,
            ..Config::default()
        };

        assert!(config.validate().unwrap_err().to_string().contains("STORE_TIMEOUT_MS"));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_metrics_addr_disabled() {
        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(config.metrics_addr().is_none());
    }
}
