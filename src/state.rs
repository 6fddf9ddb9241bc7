//! Shared application state for Axum handlers and the admission layer.
//!
//! Holds the long-lived admission components:
//!
//! - **Identity resolver**: trusted-proxy aware client IP resolution
//! - **Origin registry**: live CORS allow-list (admin-mutable)
//! - **Quota limiter**: shared store with local fallback
//! - **Geo gate**: country gate, IP allow/deny lists
//! - **Settings**: read-only runtime settings snapshot
//!
//! # Structured Concurrency
//!
//! Background tasks (local quota sweeper, settings refresh, shared-store
//! probe) are managed with `tokio_util::task::TaskTracker` and a
//! `CancellationToken`. Call `shutdown()` to stop them before exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::geo::{CountryResolver, GeoGate, IpLists, RangeTableResolver};
use crate::handlers::socket::SOCKET_PATH;
use crate::middleware::admission::Pipeline;
use crate::middleware::cors::{OriginPolicy, OriginRegistry};
use crate::middleware::ip::{IdentityResolver, TrustedProxyConfig};
use crate::quota::{
    PolicyRegistry, QuotaLimiter, QuotaStore, RedisQuotaStore, StoreHealthConfig,
};
use crate::settings::SettingsStore;
use crate::threat::ThreatScanner;

/// Shared application state.
///
/// Cloned per request; every component sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub started_at: Instant,
    pub identity: Arc<IdentityResolver>,
    pub origins: Arc<OriginRegistry>,
    pub limiter: Arc<QuotaLimiter>,
    pub resolver: Arc<dyn CountryResolver>,
    pub geo: Arc<GeoGate>,
    pub settings: Arc<SettingsStore>,
    pub pipeline: Arc<Pipeline>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build state from configuration, loading the GeoIP table and settings file.
    ///
    /// # Errors
    ///
    /// `AppError::ConfigError` if a configured file is unreadable or a
    /// component rejects its configuration.
    pub async fn new(config: Config) -> AppResult<Self> {
        let resolver = Arc::new(RangeTableResolver::load(
            config.geoip_database_path.as_deref(),
        )?);
        Self::with_resolver(config, resolver).await
    }

    /// Build state with an explicit country resolver.
    pub async fn with_resolver(
        config: Config,
        resolver: Arc<dyn CountryResolver>,
    ) -> AppResult<Self> {
        let identity = Arc::new(IdentityResolver::new(TrustedProxyConfig::new(
            &config.trusted_proxies,
        )));

        let origin_policy = OriginPolicy::from_config(&config)
            .map_err(|e| AppError::ConfigError(e.to_string()))?;
        let origins = Arc::new(OriginRegistry::new(origin_policy));

        let registry = Arc::new(
            PolicyRegistry::new(
                config.rate_limit_policies.clone(),
                config.rate_limit_routes.clone(),
            )?
            .with_exempt_paths(config.rate_limit_exempt_paths.clone()),
        );
        let shared: Option<Arc<dyn QuotaStore>> = match &config.redis_url {
            Some(url) => {
                let store = RedisQuotaStore::new(url)
                    .map_err(|e| AppError::ConfigError(e.to_string()))?;
                info!("Shared quota store configured (Redis)");
                Some(Arc::new(store) as Arc<dyn QuotaStore>)
            }
            None => {
                info!("REDIS_URL not set, quotas are tracked per process");
                None
            }
        };
        let limiter = Arc::new(QuotaLimiter::new(
            registry,
            shared,
            StoreHealthConfig {
                failure_threshold: config.store_failure_threshold,
                retry_interval: config.store_retry_interval,
                ..StoreHealthConfig::default()
            },
            config.store_timeout,
        ));

        let settings = Arc::new(SettingsStore::from_config(&config));
        settings.load_initial().await?;

        let lists = Arc::new(IpLists::new(&config.geo_allowed_ips, &[]));
        let geo = Arc::new(GeoGate::from_config(
            &config,
            resolver.clone(),
            settings.clone(),
            lists,
        )?);
        if config.geo_restriction_enabled && !resolver.is_loaded() {
            warn!("Geo restriction enabled without a GeoIP table, every lookup will fail open");
        }

        let pipeline = Arc::new(
            Pipeline::new(
                identity.clone(),
                ThreatScanner::from_config(&config),
                limiter.clone(),
                geo.clone(),
            )
            .with_socket_paths(&[SOCKET_PATH])
            .with_response_thresholds(
                config.slow_response_threshold,
                config.large_response_bytes,
            ),
        );

        let state = Self {
            config: Arc::new(config),
            started_at: Instant::now(),
            identity,
            origins,
            limiter,
            resolver,
            geo,
            settings,
            pipeline,
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_local_sweep_task();
        state.spawn_settings_refresh_task();
        state.spawn_store_probe_task();

        Ok(state)
    }

    /// Purge expired entries from the local quota store.
    fn spawn_local_sweep_task(&self) {
        let limiter = self.limiter.clone();
        let period = self.config.local_sweep_interval.max(Duration::from_secs(1));
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Local quota sweeper received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = limiter.sweep_local();
                        trace!(removed, "Local quota store swept");
                    }
                }
            }

            debug!("Local quota sweeper shutting down");
        });
    }

    /// Re-read the settings file, if one is configured.
    fn spawn_settings_refresh_task(&self) {
        if !self.settings.has_source() {
            return;
        }
        let settings = self.settings.clone();
        let period = self.config.settings_refresh_interval.max(Duration::from_secs(1));
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Settings refresh task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => settings.refresh().await,
                }
            }

            debug!("Settings refresh task shutting down");
        });
    }

    /// Log shared-store reachability so outages show up without traffic.
    fn spawn_store_probe_task(&self) {
        if self.config.redis_url.is_none() {
            return;
        }
        let limiter = self.limiter.clone();
        let period = self.config.store_retry_interval.max(Duration::from_secs(1));
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Store probe task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => match limiter.ping_shared().await {
                        Some(Err(e)) => warn!(error = %e, "Health check: shared quota store unreachable"),
                        Some(Ok(())) => trace!("Health check: shared quota store OK"),
                        None => break,
                    },
                }
            }

            debug!("Store probe task shutting down");
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Flag shutdown and signal background tasks to stop, without waiting.
    pub fn begin_shutdown(&self) {
        self.cancellation_token.cancel();
    }

    /// Gracefully stop all background tasks.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");
        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        info!("All background tasks have completed");
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
