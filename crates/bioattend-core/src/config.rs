//! Application configuration management.
//!
//! Configuration is stored at `~/.config/bioattend/config.json`. A missing
//! file means defaults; `BIOATTEND_API_URL` and `BIOATTEND_DATA_DIR` override
//! the corresponding fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::api::client::DEFAULT_API_BASE_URL;
use crate::cache::{CacheStrategy, RouteConfig, RoutePattern, RouterOptions};
use crate::sync::{SyncMode, SyncOptions};

/// Application name used for config/data directory paths
const APP_NAME: &str = "bioattend";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default origin of the web application shell
const DEFAULT_APP_BASE_URL: &str = "http://localhost:5173";

/// Default cache version tag
const DEFAULT_BUILD_ID: &str = "biometric-attendance-v1";

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub mode: SyncMode,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Interval of the periodic background-sync signal; 0 disables it
    pub periodic_interval_secs: u64,
    /// Synced records older than this are pruned
    pub retention_days: u32,
    pub request_timeout_secs: u64,
    /// A submission left `Syncing` this long by another instance is reclaimed
    pub submission_lease_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::PerRecord,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 5 * 60 * 1_000,
            multiplier: 2.0,
            periodic_interval_secs: 5 * 60,
            retention_days: 30,
            request_timeout_secs: 30,
            submission_lease_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Samples must be stable this long before an edge is emitted
    pub debounce_ms: u64,
    /// Reachability probe interval; 0 disables probing
    pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            probe_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub app_base_url: String,
    /// Cache version tag of the installed application shell
    pub build_id: String,
    pub device_id: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub excluded_schemes: Vec<String>,
    pub vary_headers: Vec<String>,
    pub routes: Vec<RouteConfig>,
    /// Paths (relative to `app_base_url`) or absolute URLs installed with each build
    pub precache: Vec<String>,
    pub sync: SyncConfig,
    pub connectivity: ConnectivityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            app_base_url: DEFAULT_APP_BASE_URL.to_string(),
            build_id: DEFAULT_BUILD_ID.to_string(),
            device_id: None,
            data_dir: None,
            excluded_schemes: vec!["chrome-extension".to_string()],
            vary_headers: Vec::new(),
            routes: default_routes(),
            precache: [
                "/",
                "/index.html",
                "/manifest.json",
                "/favicon.ico",
                "/assets/logo-192.png",
                "/assets/logo-512.png",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            sync: SyncConfig::default(),
            connectivity: ConnectivityConfig::default(),
        }
    }
}

/// Runtime caching routes of the web application.
fn default_routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig {
            pattern: RoutePattern::UrlPrefix("https://fonts.googleapis.com".to_string()),
            cache_name: "google-fonts-stylesheets".to_string(),
            strategy: CacheStrategy::CacheFirst,
            network_timeout_seconds: None,
            max_entries: None,
            max_age_seconds: None,
        },
        RouteConfig {
            pattern: RoutePattern::UrlPrefix("https://fonts.gstatic.com".to_string()),
            cache_name: "google-fonts-webfonts".to_string(),
            strategy: CacheStrategy::CacheFirst,
            network_timeout_seconds: None,
            max_entries: Some(30),
            max_age_seconds: Some(365 * SECONDS_PER_DAY),
        },
        api_route(RoutePattern::PathContains("/api/".to_string())),
    ]
}

fn api_route(pattern: RoutePattern) -> RouteConfig {
    RouteConfig {
        pattern,
        cache_name: "api-cache".to_string(),
        strategy: CacheStrategy::NetworkFirst,
        network_timeout_seconds: Some(10),
        max_entries: Some(50),
        max_age_seconds: Some(SECONDS_PER_DAY),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply `BIOATTEND_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(url) = get("BIOATTEND_API_URL").filter(|v| !v.is_empty()) {
            self.api_base_url = url;
        }
        if let Some(dir) = get("BIOATTEND_DATA_DIR").filter(|v| !v.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    /// Directory holding the database, session and log files.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Generate the device id on first use. Returns true if one was created.
    pub fn ensure_device_id(&mut self) -> bool {
        if self.device_id.is_some() {
            return false;
        }
        let suffix: u32 = rand::thread_rng().gen();
        self.device_id = Some(format!("kiosk-{:08x}", suffix));
        true
    }

    pub fn device_id(&self) -> &str {
        self.device_id.as_deref().unwrap_or("kiosk-unknown")
    }

    /// Router options. API requests are always network-first, even when the
    /// configured routes do not cover `api_base_url`.
    pub fn router_options(&self) -> RouterOptions {
        let mut routes = self.routes.clone();
        if let Ok(mut api) = Url::parse(&self.api_base_url) {
            if !api.path().ends_with('/') {
                let path = format!("{}/", api.path());
                api.set_path(&path);
            }
            let probe = api.join("events").unwrap_or_else(|_| api.clone());
            let covered = routes
                .iter()
                .any(|r| r.strategy == CacheStrategy::NetworkFirst && r.pattern.matches(&probe));
            if !covered {
                routes.insert(0, api_route(RoutePattern::UrlPrefix(self.api_base_url.clone())));
            }
        }
        RouterOptions {
            routes,
            excluded_schemes: self.excluded_schemes.clone(),
            vary_headers: self.vary_headers.clone(),
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            mode: self.sync.mode,
            initial_backoff: Duration::from_millis(self.sync.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.sync.max_backoff_ms),
            multiplier: self.sync.multiplier,
        }
    }

    /// Absolute URLs of the precache manifest.
    pub fn precache_urls(&self) -> Result<Vec<Url>> {
        let base = Url::parse(&self.app_base_url)
            .with_context(|| format!("Invalid app base URL: {}", self.app_base_url))?;
        self.precache
            .iter()
            .map(|entry| {
                base.join(entry)
                    .with_context(|| format!("Invalid precache entry: {}", entry))
            })
            .collect()
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.sync.retention_days))
    }

    pub fn submission_lease(&self) -> chrono::Duration {
        let secs = i64::try_from(self.sync.submission_lease_secs).unwrap_or(i64::MAX / 1_000);
        chrono::Duration::seconds(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_route_api_network_first() {
        let config = Config::default();
        let options = config.router_options();
        let api = Url::parse("http://localhost:5000/api/events").unwrap();
        let route = options.routes.iter().find(|r| r.pattern.matches(&api)).unwrap();
        assert_eq!(route.strategy, CacheStrategy::NetworkFirst);
        assert_eq!(route.cache_name, "api-cache");
        assert_eq!(route.network_timeout_seconds, Some(10));
        assert_eq!(options.routes.len(), 3);
    }

    #[test]
    fn test_api_route_added_for_uncovered_base_url() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "BIOATTEND_API_URL" => Some("https://checkin.example.org".to_string()),
            _ => None,
        });
        let options = config.router_options();
        let events = Url::parse("https://checkin.example.org/events").unwrap();
        assert_eq!(options.routes[0].strategy, CacheStrategy::NetworkFirst);
        assert!(options.routes[0].pattern.matches(&events));
    }

    #[test]
    fn test_precache_urls_resolve_against_app_origin() {
        let config = Config::default();
        let urls = config.precache_urls().unwrap();
        assert_eq!(urls[0].as_str(), "http://localhost:5173/");
        assert_eq!(urls[4].as_str(), "http://localhost:5173/assets/logo-192.png");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = Config::default();
        assert!(config.ensure_device_id());
        assert!(!config.ensure_device_id());
        config.sync.mode = SyncMode::Batch;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.device_id, config.device_id);
        assert_eq!(loaded.sync.mode, SyncMode::Batch);
        assert_eq!(loaded.routes, config.routes);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"build_id": "v2", "sync": {"mode": "batch"}}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.build_id, "v2");
        assert_eq!(config.sync.mode, SyncMode::Batch);
        assert_eq!(config.sync.initial_backoff_ms, 1_000);
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
    }
}
