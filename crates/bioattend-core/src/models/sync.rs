//! Wire types for `POST /sync`, the bulk replay endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::deserialize_string_or_number;
use crate::queue::LocalId;

#[derive(Debug, Clone, Serialize)]
pub struct BatchUser {
    pub local_id: LocalId,
    pub name: String,
    pub phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchCheckIn {
    pub local_id: LocalId,
    /// Set when the check-in refers to a user registered in the same batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_local_id: Option<LocalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier_value: Option<String>,
    pub event_id: i64,
    pub session_id: i64,
    pub device_id: String,
    pub check_in_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncBatch {
    pub unsynced_users: Vec<BatchUser>,
    pub unsynced_checkins: Vec<BatchCheckIn>,
}

impl SyncBatch {
    pub fn is_empty(&self) -> bool {
        self.unsynced_users.is_empty() && self.unsynced_checkins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.unsynced_users.len() + self.unsynced_checkins.len()
    }
}

/// Per-item result of a bulk replay. Exactly one of `server_id`/`error` is expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemAck {
    pub local_id: LocalId,
    #[serde(default, deserialize_with = "deserialize_string_or_number")]
    pub server_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncAck {
    #[serde(default)]
    pub users: Vec<ItemAck>,
    #[serde(default)]
    pub checkins: Vec<ItemAck>,
}

impl SyncAck {
    pub fn find(&self, local_id: LocalId) -> Option<&ItemAck> {
        self.users
            .iter()
            .chain(self.checkins.iter())
            .find(|ack| ack.local_id == local_id)
    }
}
