//! Durable, ordered queue of domain writes awaiting server confirmation.
//!
//! Every user-initiated registration or check-in becomes exactly one
//! `LocalRecord`, written to disk before any network attempt. Only the sync
//! coordinator moves records through their lifecycle:
//!
//! ```text
//! Pending -> Syncing -> Synced(server_id)
//!               |  \-> Failed(reason, attempts) -> Syncing ...
//!               \----> Pending (transient failure rollback)
//! ```

mod record;
mod store;

pub use record::{LocalId, LocalRecord, QueueStats, RecordKind, RecordPayload, RecordState};
pub use store::LocalWriteQueue;
