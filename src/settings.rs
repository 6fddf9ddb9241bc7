//! Read-only runtime settings.
//!
//! The pipeline consults a handful of settings on every request (for example
//! `geo_restriction_enabled`). They come from a [`SettingsProvider`]; the
//! bundled [`SettingsStore`] seeds them from [`Config`] and, when
//! `SETTINGS_PATH` is set, overlays a JSON object file that is re-read every
//! `SETTINGS_REFRESH_SECS`.
//!
//! Readers get a lock-free snapshot (`ArcSwap`); a reload swaps the whole map.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};

pub mod keys {
    pub const GEO_RESTRICTION_ENABLED: &str = "geo_restriction_enabled";
    pub const GEO_ALLOWED_COUNTRY: &str = "geo_allowed_country";
    pub const GEO_ALLOWED_IPS: &str = "geo_allowed_ips";
}

/// Read-only settings lookup.
pub trait SettingsProvider: Send + Sync {
    /// Value for `key`, or `default` when absent.
    fn get_setting_value(&self, key: &str, default: Value) -> Value;

    fn setting_bool(&self, key: &str, default: bool) -> bool {
        match self.get_setting_value(key, Value::Bool(default)) {
            Value::Bool(b) => b,
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => default,
            },
            Value::Number(n) => n.as_i64().map_or(default, |n| n != 0),
            _ => default,
        }
    }

    fn setting_string(&self, key: &str, default: &str) -> String {
        match self.get_setting_value(key, Value::String(default.to_string())) {
            Value::String(s) => s,
            _ => default.to_string(),
        }
    }

    /// Array of strings, or a comma-separated string.
    fn setting_list(&self, key: &str) -> Vec<String> {
        match self.get_setting_value(key, Value::Array(Vec::new())) {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.trim().to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect(),
            Value::String(s) => crate::config::split_list(&s),
            _ => Vec::new(),
        }
    }
}

pub struct SettingsStore {
    defaults: Map<String, Value>,
    current: ArcSwap<Map<String, Value>>,
    path: Option<PathBuf>,
}

impl SettingsStore {
    pub fn new(defaults: Map<String, Value>, path: Option<PathBuf>) -> Self {
        Self {
            current: ArcSwap::from_pointee(defaults.clone()),
            defaults,
            path,
        }
    }

    /// Seed defaults from configuration. Does not read the file.
    pub fn from_config(config: &Config) -> Self {
        let mut defaults = Map::new();
        defaults.insert(
            keys::GEO_RESTRICTION_ENABLED.to_string(),
            Value::Bool(config.geo_restriction_enabled),
        );
        defaults.insert(
            keys::GEO_ALLOWED_COUNTRY.to_string(),
            Value::String(config.geo_allowed_country.clone()),
        );
        defaults.insert(
            keys::GEO_ALLOWED_IPS.to_string(),
            Value::Array(
                config
                    .geo_allowed_ips
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            ),
        );
        Self::new(defaults, config.settings_path.as_ref().map(PathBuf::from))
    }

    pub fn has_source(&self) -> bool {
        self.path.is_some()
    }

    pub fn snapshot(&self) -> Arc<Map<String, Value>> {
        self.current.load_full()
    }

    /// Replace the snapshot with `overrides` layered over the defaults.
    pub fn replace(&self, overrides: Map<String, Value>) {
        let mut merged = self.defaults.clone();
        merged.extend(overrides);
        self.current.store(Arc::new(merged));
    }

    /// Read the settings file and swap it in.
    ///
    /// Returns the number of keys loaded; `Ok(0)` when no file is configured.
    ///
    /// # Errors
    ///
    /// `AppError::ConfigError` if the file cannot be read or is not a JSON
    /// object. The previous snapshot stays in place.
    pub async fn reload(&self) -> AppResult<usize> {
        let Some(path) = &self.path else {
            return Ok(0);
        };

        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::ConfigError(format!(
                "Cannot read settings file {}: {e}",
                path.display()
            ))
        })?;

        let overrides = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return Err(AppError::ConfigError(format!(
                    "Settings file {} must contain a JSON object",
                    path.display()
                )));
            }
            Err(e) => {
                return Err(AppError::ConfigError(format!(
                    "Invalid settings file {}: {e}",
                    path.display()
                )));
            }
        };

        let count = overrides.len();
        self.replace(overrides);
        debug!(path = %path.display(), keys = count, "Settings reloaded");
        Ok(count)
    }

    /// Reload, keeping the last good snapshot on failure.
    pub async fn refresh(&self) {
        if let Err(e) = self.reload().await {
            warn!(error = %e, "Settings refresh failed, keeping previous values");
        }
    }

    /// Initial load at startup. A configured but unreadable file fails boot.
    pub async fn load_initial(&self) -> AppResult<()> {
        let count = self.reload().await?;
        if self.has_source() {
            info!(keys = count, "Settings file loaded");
        }
        Ok(())
    }
}

impl SettingsProvider for SettingsStore {
    fn get_setting_value(&self, key: &str, default: Value) -> Value {
        self.current.load().get(key).cloned().unwrap_or(default)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SettingsStore {
        SettingsStore::from_config(&Config::default())
    }

    #[test]
    fn test_defaults_from_config() {
        let s = store();
        assert!(!s.setting_bool(keys::GEO_RESTRICTION_ENABLED, true));
        assert_eq!(s.setting_string(keys::GEO_ALLOWED_COUNTRY, "US"), "YE");
        assert!(s.setting_list(keys::GEO_ALLOWED_IPS).is_empty());
    }

    #[test]
    fn test_missing_key_returns_default() {
        let s = store();
        assert_eq!(s.get_setting_value("nope", json!(7)), json!(7));
    }

    #[test]
    fn test_replace_layers_over_defaults() {
        let s = store();
        let overrides = json!({
            "geo_restriction_enabled": "true",
            "geo_allowed_ips": ["10.0.0.1", "192.168.*"]
        });
        s.replace(overrides.as_object().unwrap().clone());

        assert!(s.setting_bool(keys::GEO_RESTRICTION_ENABLED, false));
        assert_eq!(s.setting_list(keys::GEO_ALLOWED_IPS).len(), 2);
        // Untouched default survives
        assert_eq!(s.setting_string(keys::GEO_ALLOWED_COUNTRY, ""), "YE");
    }

    #[test]
    fn test_list_from_comma_string() {
        let s = store();
        s.replace(json!({"geo_allowed_ips": "1.1.1.1, 2.2.2.2"}).as_object().unwrap().clone());
        assert_eq!(s.setting_list(keys::GEO_ALLOWED_IPS), vec!["1.1.1.1", "2.2.2.2"]);
    }

    #[tokio::test]
    async fn test_reload_from_file() {
        let path = std::env::temp_dir().join(format!("settings-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, r#"{"geo_allowed_country":"DE"}"#).await.unwrap();

        let s = SettingsStore::new(Map::new(), Some(path.clone()));
        assert_eq!(s.reload().await.unwrap(), 1);
        assert_eq!(s.setting_string(keys::GEO_ALLOWED_COUNTRY, ""), "DE");

        tokio::fs::write(&path, "not json").await.unwrap();
        assert!(s.reload().await.is_err());
        assert_eq!(s.setting_string(keys::GEO_ALLOWED_COUNTRY, ""), "DE");

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_reload_without_path_is_noop() {
        let s = store();
        assert_eq!(s.reload().await.unwrap(), 0);
    }
}
