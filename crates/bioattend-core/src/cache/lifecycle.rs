//! Precache install and version activation.
//!
//! ```text
//! install(v2) ──► all assets fetched? ──no──► v2 discarded, ResourceUnavailable
//!                        │yes
//!                        ▼
//!            no active version? ──yes──► activate(v2)
//!                        │no
//!                        ▼
//!                 v2 waiting ──skip_waiting() / next start──► activate(v2)
//! ```
//!
//! Activation makes the version current and deletes every other version.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{info, warn};
use url::Url;

use super::entry::{CacheEntry, CacheStrategy};
use super::request::HttpRequest;
use super::router::Network;
use super::storage::{Caches, ASSET_STORE};
use crate::error::{Error, Result};

/// Meta key holding an installed version that is not active yet.
const WAITING_VERSION_KEY: &str = "cache.waiting_version";

/// Concurrent precache downloads
const INSTALL_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// First install, activated immediately
    Activated,
    /// Installed, waiting for `skip_waiting` or the next start
    Waiting,
    /// Version is already active
    AlreadyActive,
}

pub struct CacheLifecycle {
    caches: Arc<Caches>,
    network: Arc<dyn Network>,
}

impl CacheLifecycle {
    pub fn new(caches: Arc<Caches>, network: Arc<dyn Network>) -> Self {
        Self { caches, network }
    }

    pub fn waiting_version(&self) -> Result<Option<String>> {
        self.caches.database().get_meta(WAITING_VERSION_KEY)
    }

    /// Precache `manifest` under `version`.
    pub async fn install(&self, version: &str, manifest: &[Url]) -> Result<InstallOutcome> {
        let active = self.caches.persisted_active_version()?;
        if active.as_deref() == Some(version) {
            return Ok(InstallOutcome::AlreadyActive);
        }
        if self.waiting_version()?.as_deref() == Some(version) {
            return Ok(InstallOutcome::Waiting);
        }

        info!(version, assets = manifest.len(), "Installing cache version");
        let entries: Vec<CacheEntry> = stream::iter(manifest.iter().cloned())
            .map(|url| self.fetch_asset(url))
            .buffered(INSTALL_CONCURRENCY)
            .try_collect()
            .await?;

        self.caches.put_all_versioned(version, ASSET_STORE, &entries)?;

        if active.is_none() {
            self.activate(version)?;
            Ok(InstallOutcome::Activated)
        } else {
            self.caches.database().set_meta(WAITING_VERSION_KEY, version)?;
            info!(version, "Cache version installed, waiting for activation");
            Ok(InstallOutcome::Waiting)
        }
    }

    async fn fetch_asset(&self, url: Url) -> Result<CacheEntry> {
        let request = HttpRequest::get(url);
        let response = match self.network.fetch(&request).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                warn!(url = %request.url, status = %response.status, "Precache asset rejected");
                return Err(Error::ResourceUnavailable {
                    url: request.url.to_string(),
                });
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Precache asset fetch failed");
                return Err(Error::ResourceUnavailable {
                    url: request.url.to_string(),
                });
            }
        };
        Ok(CacheEntry::from_response(
            request.identity(&[]),
            &response,
            CacheStrategy::CacheFirst,
        ))
    }

    /// Activate the waiting version, if any. Returns the activated tag.
    pub fn skip_waiting(&self) -> Result<Option<String>> {
        match self.waiting_version()? {
            Some(version) => {
                self.activate(&version)?;
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    fn activate(&self, version: &str) -> Result<()> {
        self.caches.set_active_version(version)?;
        self.caches.database().delete_meta(WAITING_VERSION_KEY)?;
        let removed = self.caches.delete_all_except(version)?;
        info!(version, removed, "Cache version activated");
        Ok(())
    }
}
