use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Backoff, DrainOutcome, DrainReport, RemoteApi, SyncEvent, SyncMode, SyncState, SyncTrigger};
use crate::api::ApiError;
use crate::error::{Error, Result};
use crate::models::{
    BatchCheckIn, BatchUser, CheckIn, CheckInStatus, Identifier, IdentifierType, RegisterResponse,
    SyncBatch,
};
use crate::queue::{LocalId, LocalRecord, LocalWriteQueue, RecordPayload, RecordState};

/// Buffered notifications per subscriber before old ones are dropped
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub mode: SyncMode,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::PerRecord,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

/// Result of submitting one record.
#[derive(Debug)]
enum Replay {
    Synced(String),
    Rejected(String),
    /// Transient failure, record is back to pending
    Deferred(String),
    /// Record changed state under us (another process or a manual retry)
    Skipped,
}

/// Check-in identifier after resolving local references.
enum Resolved {
    Ready(IdentifierType, String),
    /// Referenced registration has no server identity yet
    Blocked(String),
    /// Referenced registration is gone or was rejected
    Invalid(String),
}

fn classify(e: ApiError) -> Replay {
    if e.is_transient() {
        Replay::Deferred(e.to_string())
    } else {
        Replay::Rejected(e.to_string())
    }
}

/// Drains the local write queue against the remote API.
pub struct SyncCoordinator {
    queue: Arc<LocalWriteQueue>,
    remote: Arc<dyn RemoteApi>,
    mode: SyncMode,
    drain_lock: tokio::sync::Mutex<()>,
    rerun: AtomicBool,
    backoff: Mutex<Backoff>,
    state: watch::Sender<SyncState>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
    pub fn new(queue: Arc<LocalWriteQueue>, remote: Arc<dyn RemoteApi>, options: SyncOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            queue,
            remote,
            mode: options.mode,
            drain_lock: tokio::sync::Mutex::new(()),
            rerun: AtomicBool::new(false),
            backoff: Mutex::new(Backoff::new(
                options.initial_backoff,
                options.max_backoff,
                options.multiplier,
            )),
            state,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn queue(&self) -> &Arc<LocalWriteQueue> {
        &self.queue
    }

    fn backoff(&self) -> MutexGuard<'_, Backoff> {
        match self.backoff.lock() {
            Ok(b) => b,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ===== Drain cycle =====

    /// Run one drain, or coalesce into the drain already running.
    pub async fn drain(&self, trigger: SyncTrigger) -> Result<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            self.rerun.store(true, Ordering::SeqCst);
            debug!(%trigger, "Drain already running, trigger coalesced");
            return Ok(DrainReport {
                synced: 0,
                rejected: 0,
                outcome: DrainOutcome::Coalesced,
            });
        };

        debug!(%trigger, mode = ?self.mode, "Starting drain");
        let mut report = DrainReport {
            synced: 0,
            rejected: 0,
            outcome: DrainOutcome::Completed,
        };

        loop {
            self.rerun.store(false, Ordering::SeqCst);
            self.state.send_replace(SyncState::Draining);

            let cycle = match self.mode {
                SyncMode::PerRecord => self.drain_records(&mut report).await,
                SyncMode::Batch => self.drain_batch(&mut report).await,
            };

            match cycle {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    let retry_in = self.enter_backoff(&reason);
                    report.outcome = DrainOutcome::Interrupted { reason, retry_in };
                    return Ok(report);
                }
                Err(e) => {
                    self.enter_backoff(&e.to_string());
                    return Err(e);
                }
            }

            if !self.rerun.swap(false, Ordering::SeqCst) {
                break;
            }
            debug!("Running coalesced follow-up cycle");
        }

        self.backoff().reset();
        self.state.send_replace(SyncState::Idle);
        let _ = self.events.send(SyncEvent::Idle);
        if report.synced > 0 || report.rejected > 0 {
            info!(synced = report.synced, rejected = report.rejected, "Drain complete");
        }
        Ok(report)
    }

    fn enter_backoff(&self, reason: &str) -> Duration {
        let (retry_in, failures) = {
            let mut backoff = self.backoff();
            let delay = backoff.next_delay();
            (delay, backoff.failures())
        };
        warn!(
            reason,
            retry_in_ms = retry_in.as_millis() as u64,
            failures,
            "Sync interrupted, backing off"
        );
        self.state.send_replace(SyncState::Backoff { retry_in });
        let _ = self.events.send(SyncEvent::BackoffScheduled { retry_in, failures });
        retry_in
    }

    /// Replay the pending snapshot one record at a time.
    /// Returns the interruption reason on a transient failure.
    async fn drain_records(&self, report: &mut DrainReport) -> Result<Option<String>> {
        self.queue.recover_interrupted()?;
        let pending = self.queue.list_pending()?;
        for record in pending {
            match self.replay(&record).await? {
                Replay::Synced(_) => report.synced += 1,
                Replay::Rejected(_) => report.rejected += 1,
                Replay::Deferred(reason) => return Ok(Some(reason)),
                Replay::Skipped => {}
            }
        }
        Ok(None)
    }

    /// Submit one record and move it to its resulting state.
    async fn replay(&self, record: &LocalRecord) -> Result<Replay> {
        let local_id = record.local_id;
        if !self.begin(local_id)? {
            return Ok(Replay::Skipped);
        }

        let result = self.submit_and_settle(record).await;
        if result.is_err() {
            self.release(local_id);
        }
        result
    }

    async fn submit_and_settle(&self, record: &LocalRecord) -> Result<Replay> {
        let local_id = record.local_id;
        let (replay, ack) = self.submit(record).await?;
        match &replay {
            Replay::Synced(server_id) => self.record_synced(local_id, server_id, ack.as_ref())?,
            Replay::Rejected(reason) => self.record_rejected(local_id, reason)?,
            Replay::Deferred(reason) => {
                debug!(%local_id, reason = %reason, "Record deferred");
                self.queue.mark_pending(local_id)?;
            }
            Replay::Skipped => {}
        }
        Ok(replay)
    }

    /// Best-effort rollback of a submission that could not be settled.
    fn release(&self, local_id: LocalId) {
        if let Err(e) = self.queue.mark_pending(local_id) {
            error!(%local_id, error = %e, "Failed to roll submission back to pending");
        }
    }

    /// Mark a record Syncing. `false` when it is no longer eligible.
    fn begin(&self, local_id: LocalId) -> Result<bool> {
        match self.queue.mark_syncing(local_id) {
            Ok(()) => Ok(true),
            Err(Error::InvalidTransition { .. }) | Err(Error::UnknownRecord(_)) => {
                debug!(%local_id, "Record changed since snapshot, skipping");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn submit(&self, record: &LocalRecord) -> Result<(Replay, Option<serde_json::Value>)> {
        match &record.payload {
            RecordPayload::UserRegistration(registration) => {
                match self.remote.register(registration).await {
                    Ok(resp) => {
                        let ack = serde_json::to_value(&resp)?;
                        Ok((Replay::Synced(resp.user_id.to_string()), Some(ack)))
                    }
                    Err(e) => Ok((classify(e), None)),
                }
            }
            RecordPayload::CheckIn(checkin) => {
                let (identifier_type, value) = match self.resolve(&checkin.identifier)? {
                    Resolved::Ready(identifier_type, value) => (identifier_type, value),
                    Resolved::Blocked(reason) => return Ok((Replay::Deferred(reason), None)),
                    Resolved::Invalid(reason) => return Ok((Replay::Rejected(reason), None)),
                };
                let request = checkin.to_request(identifier_type, value.clone());
                match self.remote.check_in(&request).await {
                    Ok(resp) => match resp.status {
                        // Warning: accepted, e.g. already checked in for this session
                        CheckInStatus::Success | CheckInStatus::Warning => {
                            let ack = serde_json::to_value(&resp)?;
                            let server_id = resp.user.map(|u| u.id.to_string()).unwrap_or(value);
                            Ok((Replay::Synced(server_id), Some(ack)))
                        }
                        CheckInStatus::Error => {
                            let reason = resp
                                .message
                                .unwrap_or_else(|| "Check-in refused".to_string());
                            Ok((Replay::Rejected(reason), None))
                        }
                    },
                    Err(e) => Ok((classify(e), None)),
                }
            }
        }
    }

    fn resolve(&self, identifier: &Identifier) -> Result<Resolved> {
        let reference = match identifier {
            Identifier::FallbackId(v) => return Ok(Resolved::Ready(IdentifierType::FallbackId, v.clone())),
            Identifier::Phone(v) => return Ok(Resolved::Ready(IdentifierType::Phone, v.clone())),
            Identifier::LocalRegistration(id) => *id,
        };

        let registration = match self.queue.get(reference) {
            Ok(record) => record,
            Err(Error::UnknownRecord(_)) => {
                return Ok(Resolved::Invalid(format!(
                    "Referenced registration #{} does not exist",
                    reference
                )))
            }
            Err(e) => return Err(e),
        };
        let RecordPayload::UserRegistration(form) = &registration.payload else {
            return Ok(Resolved::Invalid(format!("Record #{} is not a registration", reference)));
        };

        Ok(match &registration.state {
            RecordState::Synced { .. } => {
                // Kiosk check-ins identify attendees by fallback id or phone only
                let fallback_id = registration
                    .server_ack
                    .clone()
                    .and_then(|ack| serde_json::from_value::<RegisterResponse>(ack).ok())
                    .and_then(|resp| resp.fallback_id);
                match fallback_id {
                    Some(fallback_id) => Resolved::Ready(IdentifierType::FallbackId, fallback_id),
                    None => Resolved::Ready(IdentifierType::Phone, form.phone.clone()),
                }
            }
            RecordState::Failed { reason, .. } => Resolved::Invalid(format!(
                "Referenced registration #{} was rejected: {}",
                reference, reason
            )),
            RecordState::Pending | RecordState::Syncing => Resolved::Blocked(format!(
                "Referenced registration #{} is not synced yet",
                reference
            )),
        })
    }

    fn record_synced(&self, local_id: LocalId, server_id: &str, ack: Option<&serde_json::Value>) -> Result<()> {
        self.queue.mark_synced(local_id, server_id, ack)?;
        debug!(%local_id, server_id, "Record synced");
        let _ = self.events.send(SyncEvent::RecordSynced {
            local_id,
            server_id: server_id.to_string(),
        });
        Ok(())
    }

    fn record_rejected(&self, local_id: LocalId, reason: &str) -> Result<()> {
        self.queue.mark_failed(local_id, reason)?;
        warn!(%local_id, reason, "Record rejected by server");
        let _ = self.events.send(SyncEvent::RecordRejected {
            local_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    // ===== Batch mode =====

    /// Replay the pending snapshot with a single `POST /sync`.
    async fn drain_batch(&self, report: &mut DrainReport) -> Result<Option<String>> {
        self.queue.recover_interrupted()?;
        let pending = self.queue.list_pending()?;
        if pending.is_empty() {
            return Ok(None);
        }

        // Records marked Syncing and not settled yet, in queue order
        let mut in_flight = VecDeque::with_capacity(pending.len());
        let result = self.submit_batch(&pending, report, &mut in_flight).await;
        if result.is_err() {
            for local_id in in_flight {
                self.release(local_id);
            }
        }
        result
    }

    async fn submit_batch(
        &self,
        pending: &[LocalRecord],
        report: &mut DrainReport,
        in_flight: &mut VecDeque<LocalId>,
    ) -> Result<Option<String>> {
        let mut batch = SyncBatch::default();
        let mut users_in_batch = HashSet::new();
        let mut deferred = None;

        for record in pending {
            let local_id = record.local_id;
            match &record.payload {
                RecordPayload::UserRegistration(registration) => {
                    if !self.begin(local_id)? {
                        continue;
                    }
                    in_flight.push_back(local_id);
                    batch.unsynced_users.push(BatchUser {
                        local_id,
                        name: registration.name.clone(),
                        phone: registration.phone.clone(),
                        email: registration.email.clone(),
                        event_id: registration.event_id,
                    });
                    users_in_batch.insert(local_id);
                }
                RecordPayload::CheckIn(checkin) => {
                    let linked = checkin
                        .identifier
                        .local_reference()
                        .filter(|reference| users_in_batch.contains(reference));
                    let resolved = match linked {
                        Some(_) => None,
                        None => match self.resolve(&checkin.identifier)? {
                            Resolved::Ready(identifier_type, value) => Some((identifier_type, value)),
                            Resolved::Blocked(reason) => {
                                // Leave it pending for a later cycle
                                deferred.get_or_insert(reason);
                                continue;
                            }
                            Resolved::Invalid(reason) => {
                                if self.begin(local_id)? {
                                    in_flight.push_back(local_id);
                                    self.record_rejected(local_id, &reason)?;
                                    in_flight.pop_back();
                                    report.rejected += 1;
                                }
                                continue;
                            }
                        },
                    };
                    if !self.begin(local_id)? {
                        continue;
                    }
                    in_flight.push_back(local_id);
                    batch
                        .unsynced_checkins
                        .push(batch_checkin(local_id, checkin, linked, resolved));
                }
            }
        }

        if in_flight.is_empty() {
            return Ok(deferred);
        }

        debug!(items = batch.len(), "Submitting sync batch");
        match self.remote.sync_batch(&batch).await {
            Ok(ack) => {
                let mut missing = 0;
                while let Some(&local_id) = in_flight.front() {
                    let item = ack.find(local_id);
                    match item.map(|i| (&i.error, &i.server_id)) {
                        Some((Some(reason), _)) => {
                            self.record_rejected(local_id, reason)?;
                            report.rejected += 1;
                        }
                        Some((None, Some(server_id))) => {
                            let value = serde_json::to_value(item)?;
                            self.record_synced(local_id, server_id, Some(&value))?;
                            report.synced += 1;
                        }
                        _ => {
                            self.queue.mark_pending(local_id)?;
                            missing += 1;
                        }
                    }
                    in_flight.pop_front();
                }
                if missing > 0 {
                    deferred = Some(format!("{} item(s) missing from sync acknowledgement", missing));
                }
                Ok(deferred)
            }
            Err(e) if e.is_transient() => {
                for local_id in in_flight.drain(..) {
                    self.release(local_id);
                }
                Ok(Some(e.to_string()))
            }
            Err(e) => {
                let reason = e.to_string();
                while let Some(&local_id) = in_flight.front() {
                    self.record_rejected(local_id, &reason)?;
                    report.rejected += 1;
                    in_flight.pop_front();
                }
                Ok(deferred)
            }
        }
    }

    // ===== Operator actions =====

    /// Re-submit one Failed record. Waits for a running drain to finish.
    ///
    /// Returns the server id on success. A transient failure leaves the record
    /// Pending for the next drain.
    pub async fn retry_failed(&self, local_id: LocalId) -> Result<String> {
        let result = {
            let _guard = self.drain_lock.lock().await;
            self.retry_locked(local_id).await
        };
        self.drain_coalesced().await;
        result
    }

    async fn retry_locked(&self, local_id: LocalId) -> Result<String> {
        let record = self.queue.get(local_id)?;
        if !matches!(record.state, RecordState::Failed { .. }) {
            return Err(Error::InvalidTransition {
                local_id,
                from: record.state.label().to_string(),
                to: "syncing",
            });
        }

        info!(%local_id, kind = %record.kind(), "Retrying failed record");
        match self.replay(&record).await? {
            Replay::Synced(server_id) => Ok(server_id),
            Replay::Rejected(reason) => Err(Error::DefinitiveSyncRejection { local_id, reason }),
            Replay::Deferred(reason) => Err(Error::TransientSyncFailure(reason)),
            Replay::Skipped => Err(Error::TransientSyncFailure(format!(
                "Record {} changed during retry",
                local_id
            ))),
        }
    }

    /// Run the drain requested by triggers that were coalesced while the
    /// lock was held outside a drain.
    async fn drain_coalesced(&self) {
        if !self.rerun.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.drain(SyncTrigger::FollowUp).await {
            warn!(error = %e, "Follow-up drain failed");
        }
    }

    /// Wait for a running drain and hold off new ones while the guard lives.
    /// Only used at shutdown: triggers coalesced meanwhile are dropped.
    pub(crate) async fn pause(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.drain_lock.lock().await
    }

    // ===== Worker =====

    /// Worker loop: drains on every trigger and retries once backoff expires.
    /// Runs until every trigger sender is dropped.
    pub async fn run(self: Arc<Self>, mut triggers: mpsc::Receiver<SyncTrigger>) {
        let mut retry_at: Option<Instant> = None;

        loop {
            let trigger = match retry_at {
                Some(at) => tokio::select! {
                    received = triggers.recv() => match received {
                        Some(trigger) => trigger,
                        None => break,
                    },
                    _ = tokio::time::sleep_until(at) => SyncTrigger::Retry,
                },
                None => match triggers.recv().await {
                    Some(trigger) => trigger,
                    None => break,
                },
            };

            // Backoff owns the schedule until it expires
            if retry_at.is_some() && matches!(trigger, SyncTrigger::Periodic | SyncTrigger::LocalWrite) {
                debug!(%trigger, "In backoff, trigger ignored");
                continue;
            }

            retry_at = match self.drain(trigger).await {
                Ok(DrainReport {
                    outcome: DrainOutcome::Interrupted { retry_in, .. },
                    ..
                }) => Some(Instant::now() + retry_in),
                Ok(DrainReport {
                    outcome: DrainOutcome::Coalesced,
                    ..
                }) => retry_at,
                Ok(_) => None,
                Err(e) => {
                    error!(error = %e, "Drain failed");
                    match self.state() {
                        SyncState::Backoff { retry_in } => Some(Instant::now() + retry_in),
                        _ => None,
                    }
                }
            };
        }
        debug!("Sync worker stopped");
    }
}

fn batch_checkin(
    local_id: LocalId,
    checkin: &CheckIn,
    user_local_id: Option<LocalId>,
    resolved: Option<(IdentifierType, String)>,
) -> BatchCheckIn {
    let (identifier_type, identifier_value) = match resolved {
        Some((identifier_type, value)) => (Some(identifier_type.as_str().to_string()), Some(value)),
        None => (None, None),
    };
    BatchCheckIn {
        local_id,
        user_local_id,
        identifier_type,
        identifier_value,
        event_id: checkin.event_id,
        session_id: checkin.session_id,
        device_id: checkin.device_id.clone(),
        check_in_time: checkin.checked_in_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{CheckInRequest, CheckInResponse, ItemAck, Registration, SyncAck};
    use async_trait::async_trait;
    use chrono::Utc;

    /// In-process stand-in for the backend that records what it receives.
    #[derive(Default)]
    struct FakeRemote {
        offline: AtomicBool,
        checkins_offline: AtomicBool,
        drop_acks: AtomicBool,
        omit_fallback_id: AtomicBool,
        reject_phone: Mutex<Option<String>>,
        registrations: Mutex<Vec<String>>,
        checkins: Mutex<Vec<CheckInRequest>>,
        batches: Mutex<Vec<SyncBatch>>,
        hold: tokio::sync::Mutex<()>,
    }

    impl FakeRemote {
        fn rejects(&self, phone: &str) -> bool {
            self.reject_phone.lock().unwrap().as_deref() == Some(phone)
        }
    }

    #[async_trait]
    impl RemoteApi for FakeRemote {
        async fn register(&self, registration: &Registration) -> std::result::Result<RegisterResponse, ApiError> {
            let _hold = self.hold.lock().await;
            if self.offline.load(Ordering::SeqCst) {
                return Err(ApiError::Unreachable("offline".to_string()));
            }
            if self.rejects(&registration.phone) {
                return Err(ApiError::Validation("Phone number already registered".to_string()));
            }
            let mut registrations = self.registrations.lock().unwrap();
            registrations.push(registration.name.clone());
            let user_id = 100 + registrations.len() as i64;
            Ok(RegisterResponse {
                user_id,
                fallback_id: (!self.omit_fallback_id.load(Ordering::SeqCst)).then(|| format!("F{}", user_id)),
                message: None,
            })
        }

        async fn check_in(&self, request: &CheckInRequest) -> std::result::Result<CheckInResponse, ApiError> {
            if self.offline.load(Ordering::SeqCst) || self.checkins_offline.load(Ordering::SeqCst) {
                return Err(ApiError::Timeout(10));
            }
            self.checkins.lock().unwrap().push(request.clone());
            Ok(CheckInResponse {
                status: CheckInStatus::Success,
                user: None,
                message: None,
            })
        }

        async fn sync_batch(&self, batch: &SyncBatch) -> std::result::Result<SyncAck, ApiError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(ApiError::Unreachable("offline".to_string()));
            }
            self.batches.lock().unwrap().push(batch.clone());
            if self.drop_acks.load(Ordering::SeqCst) {
                return Ok(SyncAck::default());
            }
            let users = batch
                .unsynced_users
                .iter()
                .map(|u| ItemAck {
                    local_id: u.local_id,
                    server_id: (!self.rejects(&u.phone)).then(|| format!("U{}", u.local_id)),
                    error: self.rejects(&u.phone).then(|| "Phone number already registered".to_string()),
                })
                .collect();
            let checkins = batch
                .unsynced_checkins
                .iter()
                .map(|c| ItemAck {
                    local_id: c.local_id,
                    server_id: Some(format!("C{}", c.local_id)),
                    error: None,
                })
                .collect();
            Ok(SyncAck { users, checkins })
        }
    }

    /// Makes every transition to Synced fail, as a full disk would.
    const REFUSE_SYNCED: &str = "CREATE TRIGGER refuse_synced BEFORE UPDATE OF state ON write_queue
         WHEN NEW.state = 'synced'
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;";

    fn setup(mode: SyncMode) -> (Arc<SyncCoordinator>, Arc<LocalWriteQueue>, Arc<FakeRemote>) {
        let (coordinator, queue, remote, _db) = setup_with_db(mode);
        (coordinator, queue, remote)
    }

    fn setup_with_db(
        mode: SyncMode,
    ) -> (Arc<SyncCoordinator>, Arc<LocalWriteQueue>, Arc<FakeRemote>, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let queue = Arc::new(LocalWriteQueue::new(Arc::clone(&db)).unwrap());
        let remote = Arc::new(FakeRemote::default());
        let options = SyncOptions {
            mode,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
            multiplier: 2.0,
        };
        let coordinator = Arc::new(SyncCoordinator::new(queue.clone(), remote.clone(), options));
        (coordinator, queue, remote, db)
    }

    fn registration(name: &str, phone: &str) -> RecordPayload {
        RecordPayload::UserRegistration(Registration {
            name: name.to_string(),
            phone: phone.to_string(),
            email: None,
            event_id: Some(1),
        })
    }

    fn check_in(identifier: Identifier) -> RecordPayload {
        RecordPayload::CheckIn(CheckIn {
            identifier,
            event_id: 1,
            session_id: 2,
            device_id: "kiosk-1".to_string(),
            checked_in_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_offline_records_sync_exactly_once() {
        let (coordinator, queue, remote) = setup(SyncMode::PerRecord);
        remote.offline.store(true, Ordering::SeqCst);
        queue.enqueue(registration("Ada", "555-0100")).unwrap();
        queue.enqueue(check_in(Identifier::Phone("555-0199".to_string()))).unwrap();
        queue.enqueue(registration("Grace", "555-0101")).unwrap();

        let offline = coordinator.drain(SyncTrigger::Manual).await.unwrap();
        assert!(matches!(offline.outcome, DrainOutcome::Interrupted { .. }));
        assert_eq!(queue.stats().unwrap().pending, 3);

        remote.offline.store(false, Ordering::SeqCst);
        let report = coordinator.drain(SyncTrigger::Reconnected).await.unwrap();
        assert_eq!(
            report,
            DrainReport {
                synced: 3,
                rejected: 0,
                outcome: DrainOutcome::Completed,
            }
        );

        let again = coordinator.drain(SyncTrigger::Manual).await.unwrap();
        assert_eq!(again.synced, 0);

        let received = remote.registrations.lock().unwrap().len() + remote.checkins.lock().unwrap().len();
        assert_eq!(received, 3);
        assert_eq!(queue.stats().unwrap().synced, 3);
        assert_eq!(coordinator.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_order_and_resolves_local_reference() {
        let (coordinator, queue, remote) = setup(SyncMode::PerRecord);
        let r1 = queue.enqueue(registration("Ada", "555-0100")).unwrap();
        let r2 = queue.enqueue(check_in(Identifier::LocalRegistration(r1))).unwrap();

        remote.checkins_offline.store(true, Ordering::SeqCst);
        let first = coordinator.drain(SyncTrigger::Manual).await.unwrap();
        assert_eq!(first.synced, 1);
        assert!(matches!(first.outcome, DrainOutcome::Interrupted { .. }));
        assert_eq!(queue.get(r2).unwrap().state, RecordState::Pending);

        queue.enqueue(check_in(Identifier::Phone("555-0142".to_string()))).unwrap();
        remote.checkins_offline.store(false, Ordering::SeqCst);
        let second = coordinator.drain(SyncTrigger::Retry).await.unwrap();
        assert_eq!(second.synced, 2);

        let checkins = remote.checkins.lock().unwrap();
        assert_eq!(checkins.len(), 2);
        assert_eq!(checkins[0].identifier_type, IdentifierType::FallbackId);
        assert_eq!(checkins[0].identifier_value, "F101");
        assert_eq!(checkins[1].identifier_value, "555-0142");
        assert!(queue.get(r2).unwrap().state.is_synced());
    }

    #[tokio::test]
    async fn test_definitive_rejection_continues_with_next_record() {
        let (coordinator, queue, remote) = setup(SyncMode::PerRecord);
        *remote.reject_phone.lock().unwrap() = Some("555-0100".to_string());
        let mut events = coordinator.subscribe();

        let r1 = queue.enqueue(registration("Ada", "555-0100")).unwrap();
        let r2 = queue.enqueue(check_in(Identifier::LocalRegistration(r1))).unwrap();
        let r3 = queue.enqueue(registration("Grace", "555-0101")).unwrap();

        let report = coordinator.drain(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.rejected, 2);
        assert!(report.is_complete());

        match queue.get(r1).unwrap().state {
            RecordState::Failed { reason, attempts } => {
                assert!(reason.contains("already registered"));
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected state: {other:?}"),
        }
        match queue.get(r2).unwrap().state {
            RecordState::Failed { reason, .. } => assert!(reason.contains(&format!("#{}", r1))),
            other => panic!("unexpected state: {other:?}"),
        }
        assert!(queue.get(r3).unwrap().state.is_synced());
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::RecordRejected { local_id, .. } if local_id == r1
        ));

        // Rejections are never retried automatically
        let again = coordinator.drain(SyncTrigger::Periodic).await.unwrap();
        assert_eq!((again.synced, again.rejected), (0, 0));
        assert_eq!(remote.registrations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backoff_grows_then_resets_after_success() {
        let (coordinator, queue, remote) = setup(SyncMode::PerRecord);
        remote.offline.store(true, Ordering::SeqCst);
        queue.enqueue(registration("Ada", "555-0100")).unwrap();

        let mut delays = Vec::new();
        for _ in 0..4 {
            match coordinator.drain(SyncTrigger::Manual).await.unwrap().outcome {
                DrainOutcome::Interrupted { retry_in, .. } => delays.push(retry_in),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
        assert_eq!(
            coordinator.state(),
            SyncState::Backoff {
                retry_in: Duration::from_secs(4)
            }
        );

        remote.offline.store(false, Ordering::SeqCst);
        assert!(coordinator.drain(SyncTrigger::Reconnected).await.unwrap().is_complete());

        remote.offline.store(true, Ordering::SeqCst);
        queue.enqueue(registration("Grace", "555-0101")).unwrap();
        match coordinator.drain(SyncTrigger::Manual).await.unwrap().outcome {
            DrainOutcome::Interrupted { retry_in, .. } => assert_eq!(retry_in, Duration::from_secs(1)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_trigger_during_drain_is_coalesced() {
        let (coordinator, queue, remote) = setup(SyncMode::PerRecord);
        queue.enqueue(registration("Ada", "555-0100")).unwrap();

        let held = remote.hold.lock().await;
        let running = Arc::clone(&coordinator);
        let task = tokio::spawn(async move { running.drain(SyncTrigger::Reconnected).await });
        while coordinator.state() != SyncState::Draining {
            tokio::task::yield_now().await;
        }

        queue.enqueue(registration("Grace", "555-0101")).unwrap();
        let second = coordinator.drain(SyncTrigger::Manual).await.unwrap();
        assert_eq!(second.outcome, DrainOutcome::Coalesced);

        drop(held);
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(*remote.registrations.lock().unwrap(), vec!["Ada", "Grace"]);
    }

    #[tokio::test]
    async fn test_retry_failed_record() {
        let (coordinator, queue, remote) = setup(SyncMode::PerRecord);
        *remote.reject_phone.lock().unwrap() = Some("555-0100".to_string());
        let r1 = queue.enqueue(registration("Ada", "555-0100")).unwrap();
        coordinator.drain(SyncTrigger::Manual).await.unwrap();

        let err = coordinator.retry_failed(r1).await.unwrap_err();
        assert!(matches!(err, Error::DefinitiveSyncRejection { local_id, .. } if local_id == r1));
        assert_eq!(queue.get(r1).unwrap().attempts, 2);

        *remote.reject_phone.lock().unwrap() = None;
        let server_id = coordinator.retry_failed(r1).await.unwrap();
        assert_eq!(server_id, "101");
        assert!(queue.get(r1).unwrap().state.is_synced());

        let err = coordinator.retry_failed(r1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_retry_failed_transient_returns_to_pending() {
        let (coordinator, queue, remote) = setup(SyncMode::PerRecord);
        *remote.reject_phone.lock().unwrap() = Some("555-0100".to_string());
        let r1 = queue.enqueue(registration("Ada", "555-0100")).unwrap();
        coordinator.drain(SyncTrigger::Manual).await.unwrap();

        remote.offline.store(true, Ordering::SeqCst);
        let err = coordinator.retry_failed(r1).await.unwrap_err();
        assert!(matches!(err, Error::TransientSyncFailure(_)));
        assert_eq!(queue.get(r1).unwrap().state, RecordState::Pending);
    }

    #[tokio::test]
    async fn test_batch_mode_links_checkins_to_batched_registration() {
        let (coordinator, queue, remote) = setup(SyncMode::Batch);
        let r1 = queue.enqueue(registration("Ada", "555-0100")).unwrap();
        queue.enqueue(check_in(Identifier::LocalRegistration(r1))).unwrap();
        queue.enqueue(check_in(Identifier::FallbackId("F9".to_string()))).unwrap();

        let report = coordinator.drain(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.synced, 3);
        assert!(report.is_complete());

        let batches = remote.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.unsynced_users.len(), 1);
        assert_eq!(batch.unsynced_checkins[0].user_local_id, Some(r1));
        assert_eq!(batch.unsynced_checkins[0].identifier_value, None);
        assert_eq!(batch.unsynced_checkins[1].identifier_value.as_deref(), Some("F9"));
        assert_eq!(
            queue.get(r1).unwrap().state,
            RecordState::Synced {
                server_id: format!("U{}", r1)
            }
        );
    }

    #[tokio::test]
    async fn test_batch_item_errors_and_missing_acks() {
        let (coordinator, queue, remote) = setup(SyncMode::Batch);
        *remote.reject_phone.lock().unwrap() = Some("555-0100".to_string());
        let r1 = queue.enqueue(registration("Ada", "555-0100")).unwrap();
        let report = coordinator.drain(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.rejected, 1);
        assert!(matches!(queue.get(r1).unwrap().state, RecordState::Failed { .. }));

        remote.drop_acks.store(true, Ordering::SeqCst);
        let r2 = queue.enqueue(registration("Grace", "555-0101")).unwrap();
        let report = coordinator.drain(SyncTrigger::Manual).await.unwrap();
        assert!(matches!(report.outcome, DrainOutcome::Interrupted { .. }));
        assert_eq!(queue.get(r2).unwrap().state, RecordState::Pending);
    }

    #[tokio::test]
    async fn test_second_instance_open_keeps_in_flight_submission() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bioattend.db");
        let queue = Arc::new(LocalWriteQueue::new(Arc::new(Database::open(&path).unwrap())).unwrap());
        let remote = Arc::new(FakeRemote::default());
        let coordinator = Arc::new(SyncCoordinator::new(
            queue.clone(),
            remote.clone(),
            SyncOptions::default(),
        ));
        let id = queue.enqueue(registration("Ada", "555-0100")).unwrap();

        let held = remote.hold.lock().await;
        let running = Arc::clone(&coordinator);
        let task = tokio::spawn(async move { running.drain(SyncTrigger::Manual).await });
        while queue.get(id).unwrap().state != RecordState::Syncing {
            tokio::task::yield_now().await;
        }

        // e.g. `bioattend status` next to a running `watch`
        let other_queue = Arc::new(LocalWriteQueue::new(Arc::new(Database::open(&path).unwrap())).unwrap());
        assert_eq!(other_queue.get(id).unwrap().state, RecordState::Syncing);
        let other = SyncCoordinator::new(other_queue.clone(), remote.clone(), SyncOptions::default());
        assert_eq!(other.drain(SyncTrigger::Manual).await.unwrap().synced, 0);

        drop(held);
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.synced, 1);
        assert!(other_queue.get(id).unwrap().state.is_synced());
        assert_eq!(other.drain(SyncTrigger::Manual).await.unwrap().synced, 0);
        assert_eq!(*remote.registrations.lock().unwrap(), vec!["Ada"]);
    }

    #[tokio::test]
    async fn test_store_failure_after_submit_rolls_back_to_pending() {
        let (coordinator, queue, _remote, db) = setup_with_db(SyncMode::PerRecord);
        let r1 = queue.enqueue(registration("Ada", "555-0100")).unwrap();
        let r2 = queue.enqueue(registration("Grace", "555-0101")).unwrap();
        db.conn().unwrap().execute_batch(REFUSE_SYNCED).unwrap();

        let err = coordinator.drain(SyncTrigger::Manual).await.unwrap_err();
        assert!(matches!(err, Error::PersistenceUnavailable(_)));
        let ids: Vec<LocalId> = queue.list_pending().unwrap().iter().map(|r| r.local_id).collect();
        assert_eq!(ids, vec![r1, r2]);
        assert_eq!(queue.stats().unwrap().syncing, 0);

        db.conn().unwrap().execute_batch("DROP TRIGGER refuse_synced").unwrap();
        let report = coordinator.drain(SyncTrigger::Retry).await.unwrap();
        assert_eq!(report.synced, 2);
    }

    #[tokio::test]
    async fn test_batch_store_failure_rolls_back_snapshot() {
        let (coordinator, queue, _remote, db) = setup_with_db(SyncMode::Batch);
        let r1 = queue.enqueue(registration("Ada", "555-0100")).unwrap();
        queue.enqueue(check_in(Identifier::LocalRegistration(r1))).unwrap();
        db.conn().unwrap().execute_batch(REFUSE_SYNCED).unwrap();

        assert!(coordinator.drain(SyncTrigger::Manual).await.is_err());
        let stats = queue.stats().unwrap();
        assert_eq!((stats.pending, stats.syncing), (2, 0));
    }

    #[tokio::test]
    async fn test_trigger_during_retry_runs_follow_up_drain() {
        let (coordinator, queue, remote) = setup(SyncMode::PerRecord);
        *remote.reject_phone.lock().unwrap() = Some("555-0100".to_string());
        let r1 = queue.enqueue(registration("Ada", "555-0100")).unwrap();
        coordinator.drain(SyncTrigger::Manual).await.unwrap();

        let held = remote.hold.lock().await;
        let running = Arc::clone(&coordinator);
        let retry = tokio::spawn(async move { running.retry_failed(r1).await });
        while queue.get(r1).unwrap().state != RecordState::Syncing {
            tokio::task::yield_now().await;
        }

        let r2 = queue.enqueue(registration("Grace", "555-0101")).unwrap();
        let coalesced = coordinator.drain(SyncTrigger::LocalWrite).await.unwrap();
        assert_eq!(coalesced.outcome, DrainOutcome::Coalesced);

        *remote.reject_phone.lock().unwrap() = None;
        drop(held);
        assert_eq!(retry.await.unwrap().unwrap(), "101");
        assert!(queue.get(r2).unwrap().state.is_synced());
        assert_eq!(*remote.registrations.lock().unwrap(), vec!["Ada", "Grace"]);
    }

    #[tokio::test]
    async fn test_local_reference_without_fallback_id_uses_phone() {
        let (coordinator, queue, remote) = setup(SyncMode::PerRecord);
        remote.omit_fallback_id.store(true, Ordering::SeqCst);
        let r1 = queue.enqueue(registration("Ada", "555-0100")).unwrap();
        queue.enqueue(check_in(Identifier::LocalRegistration(r1))).unwrap();

        let report = coordinator.drain(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.synced, 2);
        let checkins = remote.checkins.lock().unwrap();
        assert_eq!(checkins[0].identifier_type, IdentifierType::Phone);
        assert_eq!(checkins[0].identifier_value, "555-0100");
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_retries_after_backoff() {
        let (coordinator, queue, remote) = setup(SyncMode::PerRecord);
        remote.offline.store(true, Ordering::SeqCst);
        queue.enqueue(registration("Ada", "555-0100")).unwrap();
        let mut events = coordinator.subscribe();

        let (tx, rx) = mpsc::channel(8);
        let worker = tokio::spawn(Arc::clone(&coordinator).run(rx));
        tx.send(SyncTrigger::Manual).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), SyncEvent::BackoffScheduled { .. }));
        remote.offline.store(false, Ordering::SeqCst);

        // No further trigger: the backoff timer drives the retry
        loop {
            if events.recv().await.unwrap() == SyncEvent::Idle {
                break;
            }
        }
        assert_eq!(queue.stats().unwrap().synced, 1);

        drop(tx);
        worker.await.unwrap();
    }
}
