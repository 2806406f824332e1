use serde::{Deserialize, Serialize};

use super::deserialize_string_or_number;

/// Pre-registration form contents, as queued locally and posted to `/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,
}

impl Registration {
    /// Form-level validation performed before a registration is queued.
    /// Name and phone are mandatory; everything else is the server's call.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() || self.phone.trim().is_empty() {
            return Err("Name and Phone are required".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user_id: i64,
    #[serde(default, deserialize_with = "deserialize_string_or_number")]
    pub fallback_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
