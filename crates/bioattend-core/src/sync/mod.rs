//! Replay of the local write queue against the remote API.
//!
//! Drain cycle state machine:
//!
//! ```text
//! Idle ──trigger──► Draining ──all processed──► Idle
//!                      │
//!                      └──transient failure──► Backoff ──delay / trigger──► Draining
//! ```
//!
//! Only one drain runs at a time. A trigger that arrives mid-drain is
//! coalesced into one follow-up cycle.

mod backoff;
mod coordinator;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::api::ApiError;
use crate::models::{CheckInRequest, CheckInResponse, RegisterResponse, Registration, SyncAck, SyncBatch};
use crate::queue::LocalId;

pub use backoff::Backoff;
pub use coordinator::{SyncCoordinator, SyncOptions};

/// Remote endpoints the coordinator replays records against.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn register(&self, registration: &Registration) -> Result<RegisterResponse, ApiError>;
    async fn check_in(&self, request: &CheckInRequest) -> Result<CheckInResponse, ApiError>;
    async fn sync_batch(&self, batch: &SyncBatch) -> Result<SyncAck, ApiError>;
}

/// How pending records are submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// One request per record, in queue order
    #[default]
    PerRecord,
    /// The whole pending snapshot in a single `POST /sync`
    Batch,
}

/// Why a drain was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Offline -> online edge
    Reconnected,
    /// Operator asked for "sync now"
    Manual,
    /// Periodic background-sync signal
    Periodic,
    /// A record was just queued while online
    LocalWrite,
    /// Backoff delay elapsed
    Retry,
    /// Triggers that arrived while a manual retry held the queue
    FollowUp,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncTrigger::Reconnected => "reconnected",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::LocalWrite => "local_write",
            SyncTrigger::Retry => "retry",
            SyncTrigger::FollowUp => "follow_up",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Draining,
    Backoff { retry_in: Duration },
}

/// Sync notifications for the UI and operator views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    RecordSynced { local_id: LocalId, server_id: String },
    RecordRejected { local_id: LocalId, reason: String },
    BackoffScheduled { retry_in: Duration, failures: u32 },
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every pending record was processed
    Completed,
    /// Stopped at a transient failure; the next attempt is scheduled
    Interrupted { reason: String, retry_in: Duration },
    /// Another drain was already running and will pick up new records
    Coalesced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub synced: usize,
    pub rejected: usize,
    pub outcome: DrainOutcome,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == DrainOutcome::Completed
    }
}
