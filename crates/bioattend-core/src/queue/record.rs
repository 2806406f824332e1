use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CheckIn, Registration};

/// Opaque, sequential identity assigned when a record is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub i64);

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LocalId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim_start_matches('#').parse().map(LocalId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    UserRegistration,
    CheckIn,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::UserRegistration => "user_registration",
            RecordKind::CheckIn => "check_in",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_registration" => Some(RecordKind::UserRegistration),
            "check_in" => Some(RecordKind::CheckIn),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::UserRegistration => write!(f, "Registration"),
            RecordKind::CheckIn => write!(f, "Check-in"),
        }
    }
}

/// Domain fields of a queued write.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPayload {
    UserRegistration(Registration),
    CheckIn(CheckIn),
}

impl RecordPayload {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordPayload::UserRegistration(_) => RecordKind::UserRegistration,
            RecordPayload::CheckIn(_) => RecordKind::CheckIn,
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Result<String> {
        match self {
            RecordPayload::UserRegistration(reg) => serde_json::to_string(reg),
            RecordPayload::CheckIn(checkin) => serde_json::to_string(checkin),
        }
    }

    pub(crate) fn from_json(kind: RecordKind, json: &str) -> serde_json::Result<Self> {
        match kind {
            RecordKind::UserRegistration => serde_json::from_str(json).map(RecordPayload::UserRegistration),
            RecordKind::CheckIn => serde_json::from_str(json).map(RecordPayload::CheckIn),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    Syncing,
    Synced { server_id: String },
    Failed { reason: String, attempts: u32 },
}

impl RecordState {
    /// Name stored in the `state` column.
    pub fn label(&self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Syncing => "syncing",
            RecordState::Synced { .. } => "synced",
            RecordState::Failed { .. } => "failed",
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, RecordState::Synced { .. })
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordState::Pending => write!(f, "pending"),
            RecordState::Syncing => write!(f, "syncing"),
            RecordState::Synced { server_id } => write!(f, "synced ({})", server_id),
            RecordState::Failed { reason, attempts } => {
                write!(f, "failed after {} attempt(s): {}", attempts, reason)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalRecord {
    pub local_id: LocalId,
    pub payload: RecordPayload,
    pub state: RecordState,
    /// Number of submissions attempted so far.
    pub attempts: u32,
    /// Raw server acknowledgement, kept once the record is synced.
    pub server_ack: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalRecord {
    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }
}

/// Record counts by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub failed: usize,
}

impl QueueStats {
    /// Records not yet confirmed by the server and still eligible for replay.
    pub fn unsynced(&self) -> usize {
        self.pending + self.syncing
    }
}
