//! Durable SQLite database shared by the response cache and the write queue.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Error, Result};

/// Database file name inside the data directory
pub const DB_FILE: &str = "bioattend.db";

/// How long a statement waits for a lock held by another connection
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed-width UTC timestamp, so stored values order correctly as text.
pub(crate) fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Schema for the cache, write queue and metadata tables.
const SCHEMA: &str = r#"
-- Cached network responses and precached assets, versioned by build tag
CREATE TABLE IF NOT EXISTS cache_entries (
    version_tag TEXT NOT NULL,
    store_name TEXT NOT NULL,
    key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    payload BLOB NOT NULL,
    strategy TEXT NOT NULL,
    stored_at TEXT NOT NULL,
    etag_or_hash TEXT NOT NULL,
    PRIMARY KEY (version_tag, store_name, key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_stored
    ON cache_entries(version_tag, store_name, stored_at);

-- Pending domain writes, oldest first by local_id
CREATE TABLE IF NOT EXISTS write_queue (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    server_id TEXT,
    server_ack TEXT,
    failure_reason TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    -- Instance submitting the record, and since when, while state = 'syncing'
    sync_owner TEXT,
    syncing_since TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_write_queue_state
    ON write_queue(state, local_id);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Database connection wrapper.
///
/// Every change to durable state is a single autocommitted statement or an
/// explicit transaction.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::PersistenceUnavailable(format!(
                    "Failed to create data directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            Error::PersistenceUnavailable(format!(
                "Failed to open database at {}: {}",
                path.display(),
                e
            ))
        })?;

        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        // FULL: an enqueue is on disk once its INSERT returns.
        conn.pragma_update(None, "synchronous", "FULL")?;
        // Another process (e.g. `watch`) may hold the write lock briefly
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        debug!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// In-memory database, used by tests and ephemeral kiosks.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn()?
            .execute_batch(SCHEMA)
            .map_err(|e| Error::PersistenceUnavailable(format!("Failed to run migrations: {}", e)))
    }

    /// Lock the connection.
    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::PersistenceUnavailable(format!("Lock poisoned: {}", e)))
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_meta(&self, key: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM meta WHERE key = ?", params![key])?;
        Ok(())
    }
}
