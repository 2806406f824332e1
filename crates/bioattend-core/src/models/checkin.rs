use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::User;
use crate::queue::LocalId;

/// How the kiosk identified the attendee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    FallbackId,
    Phone,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::FallbackId => "fallback_id",
            IdentifierType::Phone => "phone",
        }
    }
}

/// Attendee identity carried by a queued check-in.
///
/// `LocalRegistration` points at a registration that was captured on this
/// device and may not have a server identity yet; it is resolved when the
/// check-in is replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Identifier {
    FallbackId(String),
    Phone(String),
    LocalRegistration(LocalId),
}

impl Identifier {
    pub fn local_reference(&self) -> Option<LocalId> {
        match self {
            Identifier::LocalRegistration(id) => Some(*id),
            _ => None,
        }
    }
}

/// A check-in as captured at the kiosk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckIn {
    pub identifier: Identifier,
    pub event_id: i64,
    pub session_id: i64,
    pub device_id: String,
    pub checked_in_at: DateTime<Utc>,
}

impl CheckIn {
    /// Build the `/checkin` body once the identifier has been resolved.
    pub fn to_request(&self, identifier_type: IdentifierType, identifier_value: String) -> CheckInRequest {
        CheckInRequest {
            identifier_type,
            identifier_value,
            event_id: self.event_id,
            session_id: self.session_id,
            device_id: self.device_id.clone(),
            method: identifier_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckInRequest {
    pub identifier_type: IdentifierType,
    pub identifier_value: String,
    pub event_id: i64,
    pub session_id: i64,
    pub device_id: String,
    pub method: IdentifierType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckInStatus {
    Success,
    /// Accepted but noteworthy, e.g. the attendee was already checked in.
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInResponse {
    pub status: CheckInStatus,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_serialization() {
        let id = Identifier::LocalRegistration(LocalId(7));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#"{"type":"local_registration","value":7}"#);

        let back: Identifier = serde_json::from_str(r#"{"type":"phone","value":"5551234567"}"#).unwrap();
        assert_eq!(back, Identifier::Phone("5551234567".to_string()));
    }

    #[test]
    fn test_to_request_sets_method_from_identifier_type() {
        let checkin = CheckIn {
            identifier: Identifier::Phone("5551234567".to_string()),
            event_id: 1,
            session_id: 2,
            device_id: "kiosk-1".to_string(),
            checked_in_at: Utc::now(),
        };
        let req = checkin.to_request(IdentifierType::Phone, "5551234567".to_string());
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["identifier_type"], "phone");
        assert_eq!(json["method"], "phone");
        assert_eq!(json["session_id"], 2);
    }

    #[test]
    fn test_check_in_response_warning() {
        let json = r#"{"status": "warning", "user": {"id": 4, "name": "Ada"}, "message": "Already checked in"}"#;
        let resp: CheckInResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.status, CheckInStatus::Warning);
        assert_eq!(resp.user.map(|u| u.id), Some(4));
    }
}
