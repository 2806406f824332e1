//! Offline engine: the explicitly constructed owner of every cache, queue
//! and sync component.
//!
//! `open` runs the start-up sequence (database, cache version activation,
//! crash recovery of the queue). `start_background` adds the long-running
//! tasks: the sync worker, reconnect forwarding, the reachability probe, the
//! periodic background-sync signal and the precache install.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{ApiClient, ApiError};
use crate::cache::{
    CacheEvent, CacheLifecycle, CacheRouter, Caches, HttpRequest, InstallOutcome, Network,
    ResponseSource, Routed, StoreSummary,
};
use crate::config::Config;
use crate::connectivity::{ConnectivityEdge, ConnectivityMonitor};
use crate::db::{Database, DB_FILE};
use crate::error::{Error, Result};
use crate::models::{
    CheckIn, Dashboard, Event, EventSession, Identifier, NewEvent, NewSession, Registration,
    TimeRange, User,
};
use crate::queue::{LocalId, LocalRecord, LocalWriteQueue, QueueStats, RecordKind, RecordPayload};
use crate::sync::{DrainReport, SyncCoordinator, SyncEvent, SyncState, SyncTrigger};

// ============================================================================
// Constants
// ============================================================================

/// Buffer size for the sync trigger channel.
/// Triggers coalesce in the coordinator, so a full buffer only drops duplicates.
const CHANNEL_BUFFER_SIZE: usize = 32;

/// Signals delivered by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// Activate the waiting cache version now
    SkipWaiting,
    /// Periodic background-sync wakeup
    BackgroundSync,
    Online,
    Offline,
}

/// Decoded read-through data and where it came from.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub data: T,
    pub source: ResponseSource,
}

impl<T> Fetched<T> {
    pub fn is_stale(&self) -> bool {
        self.source.is_stale()
    }
}

pub struct OfflineEngine {
    config: Config,
    api: ApiClient,
    manifest: Vec<Url>,
    caches: Arc<Caches>,
    router: Arc<CacheRouter>,
    lifecycle: Arc<CacheLifecycle>,
    queue: Arc<LocalWriteQueue>,
    coordinator: Arc<SyncCoordinator>,
    connectivity: ConnectivityMonitor,
    triggers: mpsc::Sender<SyncTrigger>,
    trigger_rx: Option<mpsc::Receiver<SyncTrigger>>,
    tasks: Vec<JoinHandle<()>>,
}

impl OfflineEngine {
    /// Open the engine against `<data_dir>/bioattend.db`.
    pub async fn open(config: Config, token: Option<String>) -> anyhow::Result<Self> {
        let data_dir = config.data_dir()?;
        let db = Database::open(&data_dir.join(DB_FILE))
            .with_context(|| format!("Failed to open local store in {}", data_dir.display()))?;
        Self::with_database(config, Arc::new(db), token)
    }

    /// Start-up sequence over an already opened database. Must be called
    /// inside a tokio runtime.
    pub fn with_database(
        config: Config,
        db: Arc<Database>,
        token: Option<String>,
    ) -> anyhow::Result<Self> {
        let manifest = config.precache_urls()?;

        let mut api = ApiClient::new(&config.api_base_url, config.sync.request_timeout_secs)?;
        if let Some(token) = token {
            api = api.with_token(token);
        }
        let network: Arc<dyn Network> = Arc::new(api.clone());

        let caches = Arc::new(Caches::open(Arc::clone(&db), &config.build_id)?);
        let lifecycle = Arc::new(CacheLifecycle::new(Arc::clone(&caches), Arc::clone(&network)));
        if let Some(version) = lifecycle.skip_waiting()? {
            info!(version = %version, "Activated cache version installed by a previous run");
        }
        let router = Arc::new(CacheRouter::new(network, Arc::clone(&caches), config.router_options()));

        let queue = Arc::new(LocalWriteQueue::with_lease(db, config.submission_lease())?);
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&queue),
            Arc::new(api.clone()),
            config.sync_options(),
        ));

        let (triggers, trigger_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        // Optimistic until the probe or the host says otherwise
        let connectivity =
            ConnectivityMonitor::spawn(true, Duration::from_millis(config.connectivity.debounce_ms));

        debug!(
            api = %api.base_url(),
            cache_version = %caches.active_version(),
            authenticated = api.has_token(),
            "Engine opened"
        );

        Ok(Self {
            config,
            api,
            manifest,
            caches,
            router,
            lifecycle,
            queue,
            coordinator,
            connectivity,
            triggers,
            trigger_rx: Some(trigger_rx),
            tasks: Vec::new(),
        })
    }

    /// Spawn the background tasks. Calling it twice is a no-op.
    pub fn start_background(&mut self) {
        let Some(trigger_rx) = self.trigger_rx.take() else {
            return;
        };

        self.tasks
            .push(tokio::spawn(Arc::clone(&self.coordinator).run(trigger_rx)));
        self.tasks.push(self.forward_reconnects());

        let probe_interval = self.config.connectivity.probe_interval_secs;
        if probe_interval > 0 {
            self.tasks.push(
                self.connectivity
                    .spawn_probe(Arc::new(self.api.clone()), Duration::from_secs(probe_interval)),
            );
        }

        let periodic = self.config.sync.periodic_interval_secs;
        if periodic > 0 {
            self.tasks.push(self.periodic_sync(Duration::from_secs(periodic)));
        }

        let lifecycle = Arc::clone(&self.lifecycle);
        let version = self.config.build_id.clone();
        let manifest = self.manifest.clone();
        self.tasks.push(tokio::spawn(async move {
            match lifecycle.install(&version, &manifest).await {
                Ok(outcome) => debug!(version = %version, ?outcome, "Precache checked"),
                Err(e) => warn!(version = %version, error = %e, "Precache install failed"),
            }
        }));

        info!(tasks = self.tasks.len(), "Background tasks started");
    }

    /// Offline -> online edges become drain triggers.
    fn forward_reconnects(&self) -> JoinHandle<()> {
        let mut edges = self.connectivity.subscribe();
        let triggers = self.triggers.clone();
        tokio::spawn(async move {
            loop {
                match edges.recv().await {
                    Ok(ConnectivityEdge::Online) => {
                        if triggers.send(SyncTrigger::Reconnected).await.is_err() {
                            break;
                        }
                    }
                    Ok(ConnectivityEdge::Offline) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "Connectivity edges lagged");
                        if triggers.send(SyncTrigger::Reconnected).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// The first tick fires immediately, so start-up also drains.
    fn periodic_sync(&self, every: Duration) -> JoinHandle<()> {
        let triggers = self.triggers.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if triggers.send(SyncTrigger::Periodic).await.is_err() {
                    break;
                }
            }
        })
    }

    fn notify(&self, trigger: SyncTrigger) {
        if let Err(e) = self.triggers.try_send(trigger) {
            debug!(%trigger, error = %e, "Sync trigger dropped");
        }
    }

    /// While offline a new record waits for the reconnect edge.
    fn notify_local_write(&self) {
        if self.connectivity.is_online() {
            self.notify(SyncTrigger::LocalWrite);
        }
    }

    // ===== Local writes =====

    /// Queue a registration. Returns once it is durably stored.
    pub fn enqueue_registration(&self, registration: Registration) -> Result<LocalId> {
        registration.validate().map_err(Error::InvalidInput)?;
        let local_id = self
            .queue
            .enqueue(RecordPayload::UserRegistration(registration))?;
        info!(%local_id, "Registration queued");
        self.notify_local_write();
        Ok(local_id)
    }

    /// Queue a check-in for this device. Returns once it is durably stored.
    pub fn enqueue_check_in(
        &self,
        identifier: Identifier,
        event_id: i64,
        session_id: i64,
    ) -> Result<LocalId> {
        match &identifier {
            Identifier::FallbackId(value) | Identifier::Phone(value) if value.trim().is_empty() => {
                return Err(Error::InvalidInput("Identifier is required".to_string()));
            }
            Identifier::LocalRegistration(reference) => {
                let record = self.queue.get(*reference)?;
                if record.kind() != RecordKind::UserRegistration {
                    return Err(Error::InvalidInput(format!(
                        "Record {} is not a registration",
                        reference
                    )));
                }
            }
            _ => {}
        }

        let checkin = CheckIn {
            identifier,
            event_id,
            session_id,
            device_id: self.config.device_id().to_string(),
            checked_in_at: Utc::now(),
        };
        let local_id = self.queue.enqueue(RecordPayload::CheckIn(checkin))?;
        info!(%local_id, event_id, session_id, "Check-in queued");
        self.notify_local_write();
        Ok(local_id)
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.queue.pending_count()
    }

    pub fn record(&self, local_id: LocalId) -> Result<LocalRecord> {
        self.queue.get(local_id)
    }

    // ===== Sync =====

    /// Ask the background worker for a drain.
    pub fn trigger_sync(&self) {
        self.notify(SyncTrigger::Manual);
    }

    /// Drain in the caller's task and report the outcome.
    pub async fn sync_now(&self) -> Result<DrainReport> {
        self.coordinator.drain(SyncTrigger::Manual).await
    }

    pub fn sync_state(&self) -> SyncState {
        self.coordinator.state()
    }

    pub fn watch_sync_state(&self) -> watch::Receiver<SyncState> {
        self.coordinator.watch_state()
    }

    pub fn failed_records(&self) -> Result<Vec<LocalRecord>> {
        self.queue.list_failed()
    }

    pub async fn retry_failed(&self, local_id: LocalId) -> Result<String> {
        self.coordinator.retry_failed(local_id).await
    }

    /// Delete Synced records older than the configured retention.
    pub fn prune_synced(&self) -> Result<usize> {
        let removed = self.queue.prune_synced(self.config.retention())?;
        if removed > 0 {
            info!(removed, "Pruned synced records");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.queue.stats()
    }

    // ===== Requests =====

    /// Route a request through the response cache.
    pub async fn fetch(&self, request: HttpRequest) -> Result<Routed> {
        self.router.handle(request).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<Fetched<T>> {
        let routed = self.router.handle(HttpRequest::get(url)).await?;
        let response = routed.response;
        if !response.is_success() {
            let body = String::from_utf8_lossy(&response.body);
            return Err(ApiError::from_status(response.status, &body).into());
        }
        Ok(Fetched {
            data: response.parse_json()?,
            source: routed.source,
        })
    }

    pub async fn events(&self) -> Result<Fetched<Vec<Event>>> {
        self.get_json(self.api.events_url()?).await
    }

    pub async fn sessions(&self, event_id: i64) -> Result<Fetched<Vec<EventSession>>> {
        self.get_json(self.api.sessions_url(event_id)?).await
    }

    pub async fn users(&self) -> Result<Fetched<Vec<User>>> {
        self.get_json(self.api.users_url()?).await
    }

    pub async fn dashboard(
        &self,
        event_id: Option<i64>,
        time_range: TimeRange,
    ) -> Result<Fetched<Dashboard>> {
        self.get_json(self.api.dashboard_url(event_id, time_range)?)
            .await
    }

    pub async fn create_event(&self, event: &NewEvent) -> Result<serde_json::Value> {
        Ok(self.api.create_event(event).await?)
    }

    pub async fn create_session(
        &self,
        event_id: i64,
        session: &NewSession,
    ) -> Result<serde_json::Value> {
        Ok(self.api.create_session(event_id, session).await?)
    }

    // ===== Cache versions =====

    /// Precache the configured build.
    pub async fn install_assets(&self) -> Result<InstallOutcome> {
        self.lifecycle
            .install(&self.config.build_id, &self.manifest)
            .await
    }

    /// Activate the waiting cache version, if any.
    pub fn skip_waiting(&self) -> Result<Option<String>> {
        self.lifecycle.skip_waiting()
    }

    pub fn waiting_version(&self) -> Result<Option<String>> {
        self.lifecycle.waiting_version()
    }

    pub fn active_cache_version(&self) -> String {
        self.caches.active_version()
    }

    pub fn cache_summaries(&self) -> Result<Vec<StoreSummary>> {
        self.caches.summaries()
    }

    /// Drop every entry of a store, e.g. one left behind by a renamed route.
    pub fn evict_store(&self, store: &str) -> Result<usize> {
        let removed = self.caches.delete_store(store)?;
        info!(store, removed, "Cache store evicted");
        Ok(removed)
    }

    /// Delete entries older than their route's max age.
    pub fn expire_caches(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for route in &self.config.router_options().routes {
            let Some(max_age) = route
                .max_age_seconds
                .and_then(|s| i64::try_from(s).ok())
                .map(chrono::Duration::seconds)
            else {
                continue;
            };
            removed += self.caches.expire_before(&route.cache_name, now - max_age)?;
        }
        if removed > 0 {
            info!(removed, "Expired cache entries");
        }
        Ok(removed)
    }

    // ===== Notifications and host signals =====

    pub fn subscribe_cache(&self) -> broadcast::Receiver<CacheEvent> {
        self.router.subscribe()
    }

    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.coordinator.subscribe()
    }

    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<ConnectivityEdge> {
        self.connectivity.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn signal(&self, signal: HostSignal) -> Result<()> {
        debug!(?signal, "Host signal");
        match signal {
            HostSignal::SkipWaiting => {
                self.skip_waiting()?;
            }
            HostSignal::BackgroundSync => self.notify(SyncTrigger::Periodic),
            HostSignal::Online => self.connectivity.report(true),
            HostSignal::Offline => self.connectivity.report(false),
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Let the running drain finish, stop background tasks and flush pending
    /// cache writes.
    pub async fn shutdown(&mut self) {
        {
            let _paused = self.coordinator.pause().await;
            for task in self.tasks.drain(..) {
                task.abort();
            }
        }
        self.router.settle().await;
        debug!("Engine stopped");
    }
}

impl Drop for OfflineEngine {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RecordState;

    fn engine() -> OfflineEngine {
        let mut config = Config::default();
        // Nothing listens on port 9 locally
        config.api_base_url = "http://127.0.0.1:9/api".to_string();
        config.device_id = Some("kiosk-test".to_string());
        config.sync.request_timeout_secs = 2;
        let db = Arc::new(Database::open_in_memory().unwrap());
        OfflineEngine::with_database(config, db, None).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_validates_registration() {
        let engine = engine();
        let err = engine
            .enqueue_registration(Registration {
                name: " ".to_string(),
                phone: "5551234567".to_string(),
                email: None,
                event_id: None,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(engine.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expire_and_evict_on_empty_caches() {
        let engine = engine();
        assert_eq!(engine.expire_caches().unwrap(), 0);
        assert_eq!(engine.evict_store("api-cache").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_check_in_reference_must_be_registration() {
        let engine = engine();
        let reg = engine
            .enqueue_registration(Registration {
                name: "Ada".to_string(),
                phone: "5551234567".to_string(),
                email: None,
                event_id: Some(1),
            })
            .unwrap();
        let checkin = engine
            .enqueue_check_in(Identifier::LocalRegistration(reg), 1, 2)
            .unwrap();

        let err = engine
            .enqueue_check_in(Identifier::LocalRegistration(checkin), 1, 2)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let err = engine
            .enqueue_check_in(Identifier::LocalRegistration(LocalId(99)), 1, 2)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRecord(LocalId(99))));

        let record = engine.record(checkin).unwrap();
        match record.payload {
            RecordPayload::CheckIn(c) => assert_eq!(c.device_id, "kiosk-test"),
            other => panic!("unexpected payload: {other:?}"),
        }
        assert_eq!(engine.pending_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sync_while_unreachable_keeps_records_pending() {
        let engine = engine();
        let local_id = engine
            .enqueue_check_in(Identifier::FallbackId("4821".to_string()), 1, 2)
            .unwrap();

        let report = engine.sync_now().await.unwrap();
        assert!(!report.is_complete());
        assert_eq!(engine.record(local_id).unwrap().state, RecordState::Pending);
        assert!(matches!(engine.sync_state(), SyncState::Backoff { .. }));
    }

    #[tokio::test]
    async fn test_read_through_miss_while_unreachable() {
        let engine = engine();
        let err = engine.events().await.unwrap_err();
        assert!(matches!(err, Error::NoCachedResponse { .. }));
    }
}
