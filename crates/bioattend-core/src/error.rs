//! Error taxonomy for the offline cache and sync engine.
//!
//! A cache miss surfaces as "resource unavailable" in the UI. A failed queue
//! write blocks the optimistic confirmation of a user action.

use thiserror::Error;

use crate::api::ApiError;
use crate::queue::LocalId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No cached response available for {url}")]
    NoCachedResponse { url: String },

    #[error("Resource unavailable: {url}")]
    ResourceUnavailable { url: String },

    #[error("Local store unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("Sync interrupted by a transient failure: {0}")]
    TransientSyncFailure(String),

    #[error("Record {local_id} rejected by server: {reason}")]
    DefinitiveSyncRejection { local_id: LocalId, reason: String },

    #[error("Record {local_id} cannot move from {from} to {to}")]
    InvalidTransition {
        local_id: LocalId,
        from: String,
        to: &'static str,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown local record {0}")]
    UnknownRecord(LocalId),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::PersistenceUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
