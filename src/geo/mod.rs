//! Country-of-origin gate.
//!
//! Decision order for one request:
//!
//! 1. Deny list hit → [`GeoDecision::Blocked`] (always active)
//! 2. Gate disabled (`geo_restriction_enabled`) → allowed
//! 3. Excluded path → allowed
//! 4. IP in an allow list (settings or admin-managed) → allowed
//! 5. Country lookup fails → allowed (fail open, warned)
//! 6. Country matches `geo_allowed_country` → allowed, otherwise
//!    [`GeoDecision::Rejected`]
//!
//! Settings are read per request so toggling the gate needs no restart.

mod ip_list;
mod resolver;

use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::middleware::ip::parse_ip;
use crate::settings::{SettingsProvider, keys};

pub use ip_list::{IpListError, IpLists, IpListsListing, IpPattern, ListKind, parse_patterns};
pub use resolver::{CountryResolver, RangeTableResolver};

/// Why a request passed the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowReason {
    Disabled,
    ExcludedPath,
    AllowListed,
    CountryMatch,
    LookupFailed,
}

impl AllowReason {
    fn as_str(self) -> &'static str {
        match self {
            AllowReason::Disabled => "disabled",
            AllowReason::ExcludedPath => "excluded_path",
            AllowReason::AllowListed => "allow_listed",
            AllowReason::CountryMatch => "country_match",
            AllowReason::LookupFailed => "lookup_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoDecision {
    Allowed(AllowReason),
    /// Country mismatch.
    Rejected { ip: String, country: String },
    /// IP on the deny list.
    Blocked { ip: String },
}

impl GeoDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GeoDecision::Allowed(_))
    }
}

/// Path exclusion: a regex, or a segment-aware prefix for plain paths.
#[derive(Debug, Clone)]
enum PathRule {
    Prefix(String),
    Pattern(Regex),
}

impl PathRule {
    fn parse(raw: &str) -> AppResult<Self> {
        let is_plain = !raw.chars().any(|c| "^$()[]{}|*+?\\".contains(c));
        if is_plain {
            return Ok(PathRule::Prefix(raw.trim_end_matches('/').to_string()));
        }
        Regex::new(raw)
            .map(PathRule::Pattern)
            .map_err(|e| AppError::ConfigError(format!("Invalid excluded path '{raw}': {e}")))
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            PathRule::Prefix(prefix) => {
                prefix.is_empty()
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            }
            PathRule::Pattern(re) => re.is_match(path),
        }
    }
}

/// Strip query/fragment and collapse leading slashes.
pub fn normalize_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    format!("/{}", path.trim_start_matches('/'))
}

pub struct GeoGate {
    resolver: Arc<dyn CountryResolver>,
    settings: Arc<dyn SettingsProvider>,
    lists: Arc<IpLists>,
    excluded: Vec<PathRule>,
    default_country: String,
    /// Parsed `geo_allowed_ips`, reparsed only when the setting changes.
    settings_allow: ArcSwap<(Vec<String>, Vec<IpPattern>)>,
}

impl GeoGate {
    /// # Errors
    ///
    /// `AppError::ConfigError` on an invalid exclusion pattern.
    pub fn new(
        resolver: Arc<dyn CountryResolver>,
        settings: Arc<dyn SettingsProvider>,
        lists: Arc<IpLists>,
        excluded_paths: &[String],
        default_country: &str,
    ) -> AppResult<Self> {
        let excluded = excluded_paths
            .iter()
            .map(|p| PathRule::parse(p))
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self {
            resolver,
            settings,
            lists,
            excluded,
            default_country: default_country.to_ascii_uppercase(),
            settings_allow: ArcSwap::from_pointee((Vec::new(), Vec::new())),
        })
    }

    pub fn from_config(
        config: &Config,
        resolver: Arc<dyn CountryResolver>,
        settings: Arc<dyn SettingsProvider>,
        lists: Arc<IpLists>,
    ) -> AppResult<Self> {
        Self::new(
            resolver,
            settings,
            lists,
            &config.geo_excluded_paths,
            &config.geo_allowed_country,
        )
    }

    pub fn lists(&self) -> &Arc<IpLists> {
        &self.lists
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.excluded.iter().any(|rule| rule.matches(&path))
    }

    fn settings_allow_listed(&self, ip: &str) -> bool {
        let raw = self.settings.setting_list(keys::GEO_ALLOWED_IPS);
        if raw.is_empty() {
            return false;
        }

        let cached = self.settings_allow.load();
        if cached.0 == raw {
            return ip_list::matches_any(&cached.1, ip);
        }

        let parsed = parse_patterns(&raw);
        let hit = ip_list::matches_any(&parsed, ip);
        self.settings_allow.store(Arc::new((raw, parsed)));
        hit
    }

    /// Gate one request by path and resolved client IP.
    pub fn allow(&self, path: &str, ip: &str) -> GeoDecision {
        let decision = self.decide(path, ip);
        let outcome = match &decision {
            GeoDecision::Allowed(reason) => reason.as_str(),
            GeoDecision::Rejected { .. } => "rejected",
            GeoDecision::Blocked { .. } => "blocked",
        };
        metrics::record_geo_decision(outcome);
        decision
    }

    fn decide(&self, path: &str, ip: &str) -> GeoDecision {
        if self.lists.is_denied(ip) {
            return GeoDecision::Blocked { ip: ip.to_string() };
        }

        if !self
            .settings
            .setting_bool(keys::GEO_RESTRICTION_ENABLED, false)
        {
            return GeoDecision::Allowed(AllowReason::Disabled);
        }

        if self.is_excluded(path) {
            return GeoDecision::Allowed(AllowReason::ExcludedPath);
        }

        if self.lists.is_allowed(ip) || self.settings_allow_listed(ip) {
            return GeoDecision::Allowed(AllowReason::AllowListed);
        }

        let Some(country) = parse_ip(ip).and_then(|addr| self.resolver.country_of(addr)) else {
            warn!(ip, "Country lookup failed, allowing request");
            return GeoDecision::Allowed(AllowReason::LookupFailed);
        };

        let allowed_country = self
            .settings
            .setting_string(keys::GEO_ALLOWED_COUNTRY, &self.default_country);

        if country.eq_ignore_ascii_case(allowed_country.trim()) {
            debug!(ip, country, "Country gate passed");
            GeoDecision::Allowed(AllowReason::CountryMatch)
        } else {
            GeoDecision::Rejected {
                ip: ip.to_string(),
                country,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::settings::SettingsStore;
    use serde_json::json;

    const TABLE: &str = "134.35.0.0/16,YE\n8.8.8.0/24,US\n";

    fn gate(enabled: bool) -> (GeoGate, Arc<SettingsStore>) {
        let config = Config {
            geo_restriction_enabled: enabled,
            ..Config::default()
        };
        let settings = Arc::new(SettingsStore::from_config(&config));
        let gate = GeoGate::from_config(
            &config,
            Arc::new(RangeTableResolver::parse(TABLE)),
            settings.clone(),
            Arc::new(IpLists::default()),
        )
        .unwrap();
        (gate, settings)
    }

    #[test]
    fn test_disabled_allows_everything() {
        let (gate, _) = gate(false);
        assert_eq!(
            gate.allow("/api/products", "8.8.8.8"),
            GeoDecision::Allowed(AllowReason::Disabled)
        );
    }

    #[test]
    fn test_matching_country_admitted() {
        let (gate, _) = gate(true);
        assert_eq!(
            gate.allow("/api/products", "134.35.1.1"),
            GeoDecision::Allowed(AllowReason::CountryMatch)
        );
    }

    #[test]
    fn test_foreign_country_rejected() {
        let (gate, _) = gate(true);
        assert_eq!(
            gate.allow("/api/products", "8.8.8.8"),
            GeoDecision::Rejected {
                ip: "8.8.8.8".to_string(),
                country: "US".to_string()
            }
        );
    }

    #[test]
    fn test_excluded_paths() {
        let (gate, _) = gate(true);
        for path in [
            "/admin",
            "/admin/origins",
            "//admin/ip-lists",
            "/api/auth/login?next=/x",
            "/health",
            "/docs/index.html",
        ] {
            assert_eq!(
                gate.allow(path, "8.8.8.8"),
                GeoDecision::Allowed(AllowReason::ExcludedPath),
                "{path} should be excluded"
            );
        }
        assert!(!gate.is_excluded("/administrator"));
        assert!(!gate.is_excluded("/api/auth/register"));
    }

    #[test]
    fn test_allow_list_from_settings_and_admin() {
        let (gate, settings) = gate(true);
        settings.replace(json!({"geo_allowed_ips": ["8.8.8.*"]}).as_object().unwrap().clone());
        assert_eq!(
            gate.allow("/api/x", "8.8.8.8"),
            GeoDecision::Allowed(AllowReason::AllowListed)
        );

        gate.lists().add(ListKind::Allow, "8.8.4.0/24").unwrap();
        assert!(gate.allow("/api/x", "8.8.4.4").is_allowed());
    }

    #[test]
    fn test_lookup_failure_fails_open() {
        let (gate, _) = gate(true);
        assert_eq!(
            gate.allow("/api/x", "1.1.1.1"),
            GeoDecision::Allowed(AllowReason::LookupFailed)
        );
        assert_eq!(
            gate.allow("/api/x", "unknown"),
            GeoDecision::Allowed(AllowReason::LookupFailed)
        );
    }

    #[test]
    fn test_deny_list_applies_when_disabled() {
        let (gate, _) = gate(false);
        gate.lists().add(ListKind::Deny, "198.51.100.0/24").unwrap();
        assert_eq!(
            gate.allow("/api/x", "198.51.100.20"),
            GeoDecision::Blocked {
                ip: "198.51.100.20".to_string()
            }
        );
    }

    #[test]
    fn test_country_setting_change_takes_effect() {
        let (gate, settings) = gate(true);
        settings.replace(json!({"geo_allowed_country": "us"}).as_object().unwrap().clone());
        assert!(gate.allow("/api/x", "8.8.8.8").is_allowed());
        assert!(!gate.allow("/api/x", "134.35.1.1").is_allowed());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("///admin?x=1"), "/admin");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("api/x#frag"), "/api/x");
    }
}
