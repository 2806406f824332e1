use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::record::{LocalId, LocalRecord, QueueStats, RecordKind, RecordPayload, RecordState};
use crate::db::{timestamp, Database};
use crate::error::{Error, Result};

const SELECT_RECORD: &str = "SELECT local_id, kind, payload, state, server_id, server_ack, \
     failure_reason, attempts, created_at, updated_at FROM write_queue";

/// Row as stored, before payload and timestamps are decoded.
struct RawRecord {
    local_id: i64,
    kind: String,
    payload: String,
    state: String,
    server_id: Option<String>,
    server_ack: Option<String>,
    failure_reason: Option<String>,
    attempts: u32,
    created_at: String,
    updated_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            kind: row.get(1)?,
            payload: row.get(2)?,
            state: row.get(3)?,
            server_id: row.get(4)?,
            server_ack: row.get(5)?,
            failure_reason: row.get(6)?,
            attempts: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<LocalRecord> {
        let local_id = LocalId(self.local_id);
        let kind = RecordKind::parse(&self.kind).ok_or_else(|| {
            Error::PersistenceUnavailable(format!("Record {} has unknown kind '{}'", local_id, self.kind))
        })?;
        let payload = RecordPayload::from_json(kind, &self.payload)?;

        let state = match self.state.as_str() {
            "pending" => RecordState::Pending,
            "syncing" => RecordState::Syncing,
            "synced" => RecordState::Synced {
                server_id: self.server_id.unwrap_or_default(),
            },
            "failed" => RecordState::Failed {
                reason: self.failure_reason.unwrap_or_default(),
                attempts: self.attempts,
            },
            other => {
                return Err(Error::PersistenceUnavailable(format!(
                    "Record {} has unknown state '{}'",
                    local_id, other
                )))
            }
        };

        let server_ack = match self.server_ack {
            Some(ack) => Some(serde_json::from_str(&ack)?),
            None => None,
        };

        Ok(LocalRecord {
            local_id,
            payload,
            state,
            attempts: self.attempts,
            server_ack,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::PersistenceUnavailable(format!("Failed to parse timestamp '{}': {}", s, e)))
}

/// Default time a submission may stay `Syncing` before another instance may
/// reclaim it.
pub const DEFAULT_SUBMISSION_LEASE_SECS: i64 = 5 * 60;

/// The durable write queue.
///
/// Each lifecycle transition is one conditional `UPDATE` keyed by `local_id`,
/// so a record is never moved from a state it is not in, even when several
/// processes share the database file.
///
/// Every queue handle has its own owner token. A `Syncing` record is tagged
/// with the token of the handle submitting it and is only reclaimed by
/// another handle once its lease has run out.
pub struct LocalWriteQueue {
    db: Arc<Database>,
    owner: String,
    lease: Duration,
}

impl LocalWriteQueue {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        Self::with_lease(db, Duration::seconds(DEFAULT_SUBMISSION_LEASE_SECS))
    }

    /// Open the queue and roll back submissions abandoned by another
    /// instance more than `lease` ago.
    pub fn with_lease(db: Arc<Database>, lease: Duration) -> Result<Self> {
        let owner = format!("{}-{:08x}", std::process::id(), rand::random::<u32>());
        let queue = Self { db, owner, lease };
        queue.recover_interrupted()?;
        Ok(queue)
    }

    /// Durably record a user action. Returns once the row is committed.
    pub fn enqueue(&self, payload: RecordPayload) -> Result<LocalId> {
        let kind = payload.kind();
        let json = payload.to_json()?;
        let now = timestamp(Utc::now());

        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO write_queue (kind, payload, state, attempts, created_at, updated_at)
             VALUES (?, ?, 'pending', 0, ?, ?)",
            params![kind.as_str(), json, now, now],
        )
        .map_err(|e| Error::PersistenceUnavailable(format!("Failed to queue {}: {}", kind, e)))?;

        let local_id = LocalId(conn.last_insert_rowid());
        debug!(%local_id, kind = kind.as_str(), "Record queued");
        Ok(local_id)
    }

    pub fn get(&self, local_id: LocalId) -> Result<LocalRecord> {
        let conn = self.db.conn()?;
        let raw = conn
            .query_row(
                &format!("{} WHERE local_id = ?", SELECT_RECORD),
                params![local_id.0],
                RawRecord::from_row,
            )
            .optional()?;
        raw.ok_or(Error::UnknownRecord(local_id))?.into_record()
    }

    /// Records awaiting submission, oldest first.
    pub fn list_pending(&self) -> Result<Vec<LocalRecord>> {
        self.list_by_state("pending")
    }

    /// Records the server refused, oldest first.
    pub fn list_failed(&self) -> Result<Vec<LocalRecord>> {
        self.list_by_state("failed")
    }

    fn list_by_state(&self, state: &str) -> Result<Vec<LocalRecord>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE state = ? ORDER BY local_id ASC",
            SELECT_RECORD
        ))?;
        let raws = stmt
            .query_map(params![state], RawRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawRecord::into_record).collect()
    }

    /// Number of records the server has not yet confirmed or refused.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.stats()?.unsynced())
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM write_queue GROUP BY state")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            let count = count as usize;
            match state.as_str() {
                "pending" => stats.pending = count,
                "syncing" => stats.syncing = count,
                "synced" => stats.synced = count,
                "failed" => stats.failed = count,
                other => warn!(state = other, "Unknown record state in write queue"),
            }
        }
        Ok(stats)
    }

    /// Pending/Failed -> Syncing. Counts one more submission attempt.
    pub fn mark_syncing(&self, local_id: LocalId) -> Result<()> {
        let now = timestamp(Utc::now());
        let conn = self.db.conn()?;
        let changed = conn.execute(
            "UPDATE write_queue SET state = 'syncing', attempts = attempts + 1,
             sync_owner = ?, syncing_since = ?, updated_at = ?
             WHERE local_id = ? AND state IN ('pending', 'failed')",
            params![self.owner, now, now, local_id.0],
        )?;
        Self::check_transition(&conn, changed, local_id, "syncing")
    }

    /// Syncing -> Synced. Terminal.
    ///
    /// Also accepted for a record that was attempted and then rolled back to
    /// Pending: the server acknowledged it, so the acknowledgement wins.
    pub fn mark_synced(
        &self,
        local_id: LocalId,
        server_id: &str,
        server_ack: Option<&serde_json::Value>,
    ) -> Result<()> {
        let ack = server_ack.map(serde_json::to_string).transpose()?;
        let now = timestamp(Utc::now());
        let conn = self.db.conn()?;
        let changed = conn.execute(
            "UPDATE write_queue SET state = 'synced', server_id = ?, server_ack = ?,
             failure_reason = NULL, sync_owner = NULL, syncing_since = NULL, updated_at = ?
             WHERE local_id = ? AND (state = 'syncing' OR (state = 'pending' AND attempts > 0))",
            params![server_id, ack, now, local_id.0],
        )?;
        Self::check_transition(&conn, changed, local_id, "synced")
    }

    /// Syncing -> Failed. Kept for manual inspection and retry. Like
    /// `mark_synced`, a late answer for a rolled-back record is accepted.
    pub fn mark_failed(&self, local_id: LocalId, reason: &str) -> Result<()> {
        let now = timestamp(Utc::now());
        let conn = self.db.conn()?;
        let changed = conn.execute(
            "UPDATE write_queue SET state = 'failed', failure_reason = ?,
             sync_owner = NULL, syncing_since = NULL, updated_at = ?
             WHERE local_id = ? AND (state = 'syncing' OR (state = 'pending' AND attempts > 0))",
            params![reason, now, local_id.0],
        )?;
        Self::check_transition(&conn, changed, local_id, "failed")
    }

    /// Syncing -> Pending, after a transient failure. Only the handle that
    /// started the submission may roll it back; a record already Pending is
    /// left as is.
    pub fn mark_pending(&self, local_id: LocalId) -> Result<()> {
        let now = timestamp(Utc::now());
        let conn = self.db.conn()?;
        let changed = conn.execute(
            "UPDATE write_queue SET state = 'pending', sync_owner = NULL, syncing_since = NULL,
             updated_at = ?
             WHERE local_id = ? AND ((state = 'syncing' AND sync_owner = ?) OR state = 'pending')",
            params![now, local_id.0, self.owner],
        )?;
        Self::check_transition(&conn, changed, local_id, "pending")
    }

    /// Roll `Syncing` records of other instances whose lease has run out back
    /// to `Pending`. Records this handle is submitting are never touched.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let now = Utc::now();
        let cutoff = timestamp(now - self.lease);
        let changed = self.db.conn()?.execute(
            "UPDATE write_queue SET state = 'pending', sync_owner = NULL, syncing_since = NULL,
             updated_at = ?
             WHERE state = 'syncing'
               AND (sync_owner IS NULL OR sync_owner != ?)
               AND (syncing_since IS NULL OR syncing_since < ?)",
            params![timestamp(now), self.owner, cutoff],
        )?;
        if changed > 0 {
            info!(recovered = changed, "Rolled abandoned submissions back to pending");
        }
        Ok(changed)
    }

    /// Delete synced records last touched more than `retention` ago.
    pub fn prune_synced(&self, retention: Duration) -> Result<usize> {
        let cutoff = timestamp(Utc::now() - retention);
        let removed = self.db.conn()?.execute(
            "DELETE FROM write_queue WHERE state = 'synced' AND updated_at < ?",
            params![cutoff],
        )?;
        if removed > 0 {
            info!(removed, "Pruned synced records");
        }
        Ok(removed)
    }

    /// Turn a zero-row update into the right error.
    fn check_transition(
        conn: &Connection,
        changed: usize,
        local_id: LocalId,
        to: &'static str,
    ) -> Result<()> {
        if changed > 0 {
            return Ok(());
        }
        let current: Option<String> = conn
            .query_row(
                "SELECT state FROM write_queue WHERE local_id = ?",
                params![local_id.0],
                |row| row.get(0),
            )
            .optional()?;
        match current {
            Some(from) => Err(Error::InvalidTransition { local_id, from, to }),
            None => Err(Error::UnknownRecord(local_id)),
        }
    }
}
