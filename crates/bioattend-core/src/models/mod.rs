//! Data models for the check-in backend.
//!
//! - `Registration`, `RegisterResponse`: pre-registration of attendees
//! - `CheckIn`, `CheckInRequest`, `CheckInResponse`: kiosk check-ins
//! - `Event`, `EventSession`, `NewEvent`, `NewSession`: event management
//! - `User`: registered attendees
//! - `Dashboard`, `TimeRange`: admin attendance aggregates
//! - `SyncBatch`, `SyncAck`: bulk replay of unsynced records

pub mod checkin;
pub mod dashboard;
pub mod event;
pub mod registration;
pub mod sync;
pub mod user;

pub use checkin::{CheckIn, CheckInRequest, CheckInResponse, CheckInStatus, Identifier, IdentifierType};
pub use dashboard::{Dashboard, DashboardStats, TimeRange};
pub use event::{Event, EventSession, NewEvent, NewSession};
pub use registration::{RegisterResponse, Registration};
pub use sync::{BatchCheckIn, BatchUser, ItemAck, SyncAck, SyncBatch};
pub use user::User;

/// Accept identifiers the backend sends either as JSON strings or numbers.
pub(crate) fn deserialize_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct StringOrNumberVisitor;

    impl<'de> de::Visitor<'de> for StringOrNumberVisitor {
        type Value = Option<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or number")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
            if v.is_empty() {
                Ok(None)
            } else {
                Ok(Some(v.to_string()))
            }
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
    }

    deserializer.deserialize_any(StringOrNumberVisitor)
}
