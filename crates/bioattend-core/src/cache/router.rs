//! Request routing between the network and the response cache.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderValue;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use super::entry::{CacheEntry, CacheStrategy};
use super::request::{HttpRequest, HttpResponse, RequestIdentity};
use super::storage::{Caches, ASSET_STORE};
use crate::api::ApiError;
use crate::error::{Error, Result};

/// Header added to responses served from cache after a failed network attempt
pub const STALE_HEADER: &str = "x-bioattend-stale";

/// Buffered notifications per subscriber before old ones are dropped
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Default network-first timeout when a route does not set one
const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 10;

/// Transport used by the router for cache misses and pass-through requests.
///
/// Any HTTP status is a successful fetch; an `Err` means no response was
/// obtained at all.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, ApiError>;
}

/// URL matcher for a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RoutePattern {
    /// Scheme + host (+ optional path) prefix, e.g. `https://fonts.gstatic.com`
    UrlPrefix(String),
    /// Substring of the URL path, e.g. `/api/`
    PathContains(String),
}

impl RoutePattern {
    pub fn matches(&self, url: &Url) -> bool {
        match self {
            RoutePattern::UrlPrefix(prefix) => url.as_str().starts_with(prefix.as_str()),
            RoutePattern::PathContains(fragment) => url.path().contains(fragment.as_str()),
        }
    }
}

/// A cacheable route class and its strategy options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub pattern: RoutePattern,
    pub cache_name: String,
    pub strategy: CacheStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<u64>,
}

impl RouteConfig {
    fn max_age(&self) -> Option<chrono::Duration> {
        self.max_age_seconds
            .and_then(|s| i64::try_from(s).ok())
            .map(chrono::Duration::seconds)
    }
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Evaluated in order, first match wins
    pub routes: Vec<RouteConfig>,
    /// URL schemes that are never intercepted
    pub excluded_schemes: Vec<String>,
    /// Request headers that take part in the cache key
    pub vary_headers: Vec<String>,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            excluded_schemes: vec!["chrome-extension".to_string()],
            vary_headers: Vec::new(),
        }
    }
}

/// Where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ResponseSource {
    Network,
    Cache,
    /// Cached copy served because the network attempt failed
    Stale { stored_at: DateTime<Utc> },
    /// Not intercepted (non-GET or excluded scheme)
    Passthrough,
}

impl ResponseSource {
    pub fn is_stale(&self) -> bool {
        matches!(self, ResponseSource::Stale { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Routed {
    pub response: HttpResponse,
    pub source: ResponseSource,
}

/// Cache notifications for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Miss { url: String },
    StaleServed { url: String, stored_at: DateTime<Utc> },
}

/// Classifies requests by route and applies the matching cache strategy.
///
/// Cache writes run on blocking tasks and never delay the response; use
/// [`CacheRouter::settle`] to wait for them.
pub struct CacheRouter {
    network: Arc<dyn Network>,
    caches: Arc<Caches>,
    options: RouterOptions,
    events: broadcast::Sender<CacheEvent>,
    writes: Mutex<JoinSet<()>>,
}

impl CacheRouter {
    pub fn new(network: Arc<dyn Network>, caches: Arc<Caches>, options: RouterOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            network,
            caches,
            options,
            events,
            writes: Mutex::new(JoinSet::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub fn caches(&self) -> &Arc<Caches> {
        &self.caches
    }

    /// Route one request.
    pub async fn handle(&self, request: HttpRequest) -> Result<Routed> {
        if request.method != Method::GET || self.is_excluded(&request.url) {
            let response = self.network.fetch(&request).await?;
            return Ok(Routed {
                response,
                source: ResponseSource::Passthrough,
            });
        }

        let identity = request.identity(&self.options.vary_headers);
        match self.route_for(&request.url) {
            Some(route) if route.strategy == CacheStrategy::NetworkFirst => {
                self.network_first(&request, &identity, route).await
            }
            route => self.cache_first(&request, &identity, route).await,
        }
    }

    fn is_excluded(&self, url: &Url) -> bool {
        self.options
            .excluded_schemes
            .iter()
            .any(|scheme| scheme.eq_ignore_ascii_case(url.scheme()))
    }

    fn route_for(&self, url: &Url) -> Option<&RouteConfig> {
        self.options.routes.iter().find(|r| r.pattern.matches(url))
    }

    async fn network_first(
        &self,
        request: &HttpRequest,
        identity: &RequestIdentity,
        route: &RouteConfig,
    ) -> Result<Routed> {
        let timeout_secs = route
            .network_timeout_seconds
            .unwrap_or(DEFAULT_NETWORK_TIMEOUT_SECS);

        match tokio::time::timeout(Duration::from_secs(timeout_secs), self.network.fetch(request)).await {
            Ok(Ok(response)) => {
                if response.is_success() {
                    self.populate(route.cache_name.clone(), identity, &response, route);
                }
                return Ok(Routed {
                    response,
                    source: ResponseSource::Network,
                });
            }
            Ok(Err(e)) => {
                debug!(url = %request.url, error = %e, "Network failed, falling back to cache");
            }
            Err(_) => {
                debug!(url = %request.url, timeout_secs, "Network timed out, falling back to cache");
            }
        }

        match self.lookup(&[route.cache_name.as_str()], identity, route.max_age()) {
            Some(entry) => {
                let mut response = entry.to_response();
                response
                    .headers
                    .insert(STALE_HEADER, HeaderValue::from_static("true"));
                let _ = self.events.send(CacheEvent::StaleServed {
                    url: request.url.to_string(),
                    stored_at: entry.stored_at,
                });
                Ok(Routed {
                    response,
                    source: ResponseSource::Stale {
                        stored_at: entry.stored_at,
                    },
                })
            }
            None => {
                let _ = self.events.send(CacheEvent::Miss {
                    url: request.url.to_string(),
                });
                Err(Error::NoCachedResponse {
                    url: request.url.to_string(),
                })
            }
        }
    }

    async fn cache_first(
        &self,
        request: &HttpRequest,
        identity: &RequestIdentity,
        route: Option<&RouteConfig>,
    ) -> Result<Routed> {
        // Precached assets take precedence over runtime stores
        let store = route.map_or(ASSET_STORE, |r| r.cache_name.as_str());
        let max_age = route.and_then(RouteConfig::max_age);
        let stores: &[&str] = if store == ASSET_STORE {
            &[ASSET_STORE]
        } else {
            &[ASSET_STORE, store]
        };

        if let Some(entry) = self.lookup(stores, identity, max_age) {
            return Ok(Routed {
                response: entry.to_response(),
                source: ResponseSource::Cache,
            });
        }

        let _ = self.events.send(CacheEvent::Miss {
            url: request.url.to_string(),
        });

        match self.network.fetch(request).await {
            Ok(response) => {
                if response.is_success() {
                    match route {
                        Some(route) => self.populate(store.to_string(), identity, &response, route),
                        None => self.populate_unbounded(store.to_string(), identity, &response),
                    }
                }
                Ok(Routed {
                    response,
                    source: ResponseSource::Network,
                })
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Cache miss and network unavailable");
                Err(Error::ResourceUnavailable {
                    url: request.url.to_string(),
                })
            }
        }
    }

    /// First usable entry for `identity` across `stores`.
    ///
    /// Lookup failures are logged and treated as a miss. Expired entries are
    /// deleted and skipped.
    fn lookup(
        &self,
        stores: &[&str],
        identity: &RequestIdentity,
        max_age: Option<chrono::Duration>,
    ) -> Option<CacheEntry> {
        for store in stores {
            match self.caches.get(store, identity.key()) {
                Ok(Some(entry)) if entry.is_expired(max_age) => {
                    debug!(store, url = identity.url(), "Dropping expired cache entry");
                    if let Err(e) = self.caches.delete(store, identity.key()) {
                        warn!(store, error = %e, "Failed to delete expired cache entry");
                    }
                }
                Ok(Some(entry)) => return Some(entry),
                Ok(None) => {}
                Err(e) => {
                    warn!(store, url = identity.url(), error = %e, "Cache lookup failed");
                }
            }
        }
        None
    }

    fn populate(&self, store: String, identity: &RequestIdentity, response: &HttpResponse, route: &RouteConfig) {
        let entry = CacheEntry::from_response(identity.clone(), response, route.strategy);
        self.spawn_write(store, entry, route.max_entries);
    }

    fn populate_unbounded(&self, store: String, identity: &RequestIdentity, response: &HttpResponse) {
        let entry = CacheEntry::from_response(identity.clone(), response, CacheStrategy::CacheFirst);
        self.spawn_write(store, entry, None);
    }

    fn spawn_write(&self, store: String, entry: CacheEntry, max_entries: Option<usize>) {
        let caches = Arc::clone(&self.caches);
        let mut writes = match self.writes.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Reap finished writes so the set stays small
        while writes.try_join_next().is_some() {}

        writes.spawn_blocking(move || {
            if let Err(e) = caches.put(&store, &entry) {
                warn!(store = %store, url = entry.key.url(), error = %e, "Failed to populate cache");
                return;
            }
            if let Some(max) = max_entries {
                if let Err(e) = caches.trim(&store, max) {
                    warn!(store = %store, error = %e, "Failed to trim cache store");
                }
            }
        });
    }

    /// Wait for every cache write spawned so far.
    pub async fn settle(&self) {
        let mut pending = {
            let mut writes = match self.writes.lock() {
                Ok(w) => w,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *writes)
        };
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Cache write task failed");
            }
        }
    }
}
