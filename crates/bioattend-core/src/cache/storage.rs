use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};

use super::entry::{CacheEntry, CacheStrategy};
use super::request::RequestIdentity;
use crate::db::{timestamp, Database};
use crate::error::{Error, Result};

/// Store holding the precached application shell.
pub const ASSET_STORE: &str = "precache-assets";

/// Meta key holding the active build version tag.
pub(crate) const ACTIVE_VERSION_KEY: &str = "cache.active_version";

/// Entry count for one (version, store) pair.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoreSummary {
    pub version_tag: String,
    pub store_name: String,
    pub entries: usize,
}

/// Durable response cache, partitioned by store name and build version.
///
/// Reads and writes go to the active version. Writes replace any earlier
/// entry for the same key, so concurrent population is last-write-wins.
pub struct Caches {
    db: Arc<Database>,
    active: RwLock<String>,
}

impl Caches {
    /// Open the cache, using the persisted active version or `fallback_version`.
    pub fn open(db: Arc<Database>, fallback_version: &str) -> Result<Self> {
        let active = db
            .get_meta(ACTIVE_VERSION_KEY)?
            .unwrap_or_else(|| fallback_version.to_string());
        debug!(version = %active, "Response cache opened");
        Ok(Self {
            db,
            active: RwLock::new(active),
        })
    }

    pub fn active_version(&self) -> String {
        match self.active.read() {
            Ok(v) => v.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Active version as persisted, `None` before the first activation.
    pub fn persisted_active_version(&self) -> Result<Option<String>> {
        self.db.get_meta(ACTIVE_VERSION_KEY)
    }

    pub(crate) fn set_active_version(&self, version: &str) -> Result<()> {
        self.db.set_meta(ACTIVE_VERSION_KEY, version)?;
        match self.active.write() {
            Ok(mut v) => *v = version.to_string(),
            Err(poisoned) => *poisoned.into_inner() = version.to_string(),
        }
        Ok(())
    }

    pub(crate) fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Look up `key` in `store` under the active version.
    pub fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>> {
        let version = self.active_version();
        let conn = self.db.conn()?;
        let entry = conn
            .query_row(
                "SELECT key, method, url, status, content_type, payload, strategy, stored_at, etag_or_hash
                 FROM cache_entries WHERE version_tag = ? AND store_name = ? AND key = ?",
                params![version, store, key],
                row_to_entry,
            )
            .optional()?;
        entry.transpose()
    }

    /// Store `entry` in `store` under the active version.
    pub fn put(&self, store: &str, entry: &CacheEntry) -> Result<()> {
        let version = self.active_version();
        self.put_versioned(&version, store, entry)
    }

    pub fn put_versioned(&self, version: &str, store: &str, entry: &CacheEntry) -> Result<()> {
        insert_entry(&*self.db.conn()?, version, store, entry)?;
        Ok(())
    }

    /// Store a complete set of entries for `version` atomically.
    pub(crate) fn put_all_versioned(&self, version: &str, store: &str, entries: &[CacheEntry]) -> Result<()> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        for entry in entries {
            insert_entry(&tx, version, store, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete(&self, store: &str, key: &str) -> Result<bool> {
        let version = self.active_version();
        let removed = self.db.conn()?.execute(
            "DELETE FROM cache_entries WHERE version_tag = ? AND store_name = ? AND key = ?",
            params![version, store, key],
        )?;
        Ok(removed > 0)
    }

    /// Delete every entry whose version tag is not `version`.
    pub fn delete_all_except(&self, version: &str) -> Result<usize> {
        let removed = self
            .db
            .conn()?
            .execute("DELETE FROM cache_entries WHERE version_tag != ?", params![version])?;
        if removed > 0 {
            info!(kept = %version, removed, "Deleted entries from old cache versions");
        }
        Ok(removed)
    }

    /// Delete a whole store in every version.
    pub fn delete_store(&self, store: &str) -> Result<usize> {
        let removed = self
            .db
            .conn()?
            .execute("DELETE FROM cache_entries WHERE store_name = ?", params![store])?;
        Ok(removed)
    }

    /// Number of entries in `store` under the active version.
    pub fn count(&self, store: &str) -> Result<usize> {
        let version = self.active_version();
        let count: i64 = self.db.conn()?.query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE version_tag = ? AND store_name = ?",
            params![version, store],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Evict the oldest entries of `store` beyond `max_entries`.
    pub fn trim(&self, store: &str, max_entries: usize) -> Result<usize> {
        let version = self.active_version();
        let removed = self.db.conn()?.execute(
            "DELETE FROM cache_entries
             WHERE version_tag = ?1 AND store_name = ?2 AND key NOT IN (
                 SELECT key FROM cache_entries
                 WHERE version_tag = ?1 AND store_name = ?2
                 ORDER BY stored_at DESC
                 LIMIT ?3
             )",
            params![version, store, max_entries as i64],
        )?;
        if removed > 0 {
            debug!(store, removed, "Trimmed cache store");
        }
        Ok(removed)
    }

    /// Evict entries of `store` stored before `cutoff`.
    pub fn expire_before(&self, store: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let version = self.active_version();
        let removed = self.db.conn()?.execute(
            "DELETE FROM cache_entries WHERE version_tag = ? AND store_name = ? AND stored_at < ?",
            params![version, store, timestamp(cutoff)],
        )?;
        Ok(removed)
    }

    /// Entry counts per (version, store), for the status view.
    pub fn summaries(&self) -> Result<Vec<StoreSummary>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT version_tag, store_name, COUNT(*) FROM cache_entries
             GROUP BY version_tag, store_name ORDER BY version_tag, store_name",
        )?;
        let rows = stmt.query_map([], |row| {
            let entries: i64 = row.get(2)?;
            Ok(StoreSummary {
                version_tag: row.get(0)?,
                store_name: row.get(1)?,
                entries: entries as usize,
            })
        })?;
        let summaries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(summaries)
    }
}

fn insert_entry(conn: &Connection, version: &str, store: &str, entry: &CacheEntry) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR REPLACE INTO cache_entries
         (version_tag, store_name, key, method, url, status, content_type, payload, strategy, stored_at, etag_or_hash)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            version,
            store,
            entry.key.key(),
            entry.key.method(),
            entry.key.url(),
            entry.status,
            entry.content_type,
            entry.payload,
            entry.strategy.as_str(),
            timestamp(entry.stored_at),
            entry.etag_or_hash,
        ],
    )
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Result<CacheEntry>> {
    let key: String = row.get(0)?;
    let method: String = row.get(1)?;
    let url: String = row.get(2)?;
    let status: u16 = row.get(3)?;
    let content_type: Option<String> = row.get(4)?;
    let payload: Vec<u8> = row.get(5)?;
    let strategy: String = row.get(6)?;
    let stored_at: String = row.get(7)?;
    let etag_or_hash: String = row.get(8)?;

    let Some(strategy) = CacheStrategy::parse(&strategy) else {
        return Ok(Err(Error::PersistenceUnavailable(format!(
            "Unknown cache strategy '{}' for {}",
            strategy, url
        ))));
    };
    let stored_at = match DateTime::parse_from_rfc3339(&stored_at) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(e) => {
            return Ok(Err(Error::PersistenceUnavailable(format!(
                "Corrupt stored_at for {}: {}",
                url, e
            ))))
        }
    };

    Ok(Ok(CacheEntry {
        key: RequestIdentity::from_parts(key, method, url),
        status,
        content_type,
        payload,
        strategy,
        stored_at,
        etag_or_hash,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{HttpRequest, HttpResponse};
    use chrono::Duration;
    use reqwest::StatusCode;
    use url::Url;

    fn caches(version: &str) -> Caches {
        let db = Arc::new(Database::open_in_memory().unwrap());
        Caches::open(db, version).unwrap()
    }

    fn entry(url: &str, body: &str) -> CacheEntry {
        let request = HttpRequest::get(Url::parse(url).unwrap());
        let response = HttpResponse::new(StatusCode::OK, body.as_bytes().to_vec());
        CacheEntry::from_response(request.identity(&[]), &response, CacheStrategy::CacheFirst)
    }

    #[test]
    fn test_put_then_get() {
        let caches = caches("v1");
        let e = entry("https://kiosk.example.org/index.html", "<html>");
        caches.put(ASSET_STORE, &e).unwrap();

        let got = caches.get(ASSET_STORE, e.key.key()).unwrap().unwrap();
        assert_eq!(got.payload, b"<html>");
        assert_eq!(got.key, e.key);
        assert_eq!(got.strategy, CacheStrategy::CacheFirst);
        assert!(caches.get("api-cache", e.key.key()).unwrap().is_none());
    }

    #[test]
    fn test_put_same_key_keeps_single_entry() {
        let caches = caches("v1");
        let first = entry("https://kiosk.example.org/api/events", "[1]");
        let mut second = entry("https://kiosk.example.org/api/events", "[1,2]");
        second.stored_at = first.stored_at + Duration::seconds(5);

        caches.put("api-cache", &first).unwrap();
        caches.put("api-cache", &second).unwrap();

        assert_eq!(caches.count("api-cache").unwrap(), 1);
        let got = caches.get("api-cache", first.key.key()).unwrap().unwrap();
        assert_eq!(got.payload, b"[1,2]");
        assert_eq!(timestamp(got.stored_at), timestamp(second.stored_at));
    }

    #[test]
    fn test_delete_all_except_removes_old_versions() {
        let caches = caches("v1");
        let e = entry("https://kiosk.example.org/index.html", "old");
        caches.put(ASSET_STORE, &e).unwrap();
        caches.put_versioned("v2", ASSET_STORE, &entry("https://kiosk.example.org/index.html", "new")).unwrap();

        assert_eq!(caches.delete_all_except("v2").unwrap(), 1);
        assert!(caches.get(ASSET_STORE, e.key.key()).unwrap().is_none());

        caches.set_active_version("v2").unwrap();
        let got = caches.get(ASSET_STORE, e.key.key()).unwrap().unwrap();
        assert_eq!(got.payload, b"new");
    }

    #[test]
    fn test_active_version_persists() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let caches = Caches::open(Arc::clone(&db), "v1").unwrap();
        assert_eq!(caches.persisted_active_version().unwrap(), None);
        caches.set_active_version("v3").unwrap();

        let reopened = Caches::open(db, "v1").unwrap();
        assert_eq!(reopened.active_version(), "v3");
    }

    #[test]
    fn test_trim_evicts_oldest() {
        let caches = caches("v1");
        let now = Utc::now();
        for i in 0..5 {
            let mut e = entry(&format!("https://fonts.gstatic.com/font{}.woff2", i), "f");
            e.stored_at = now - Duration::minutes(10 - i);
            caches.put("google-fonts-webfonts", &e).unwrap();
        }

        assert_eq!(caches.trim("google-fonts-webfonts", 3).unwrap(), 2);
        assert_eq!(caches.count("google-fonts-webfonts").unwrap(), 3);

        let oldest = entry("https://fonts.gstatic.com/font0.woff2", "f");
        assert!(caches.get("google-fonts-webfonts", oldest.key.key()).unwrap().is_none());
        let newest = entry("https://fonts.gstatic.com/font4.woff2", "f");
        assert!(caches.get("google-fonts-webfonts", newest.key.key()).unwrap().is_some());
    }

    #[test]
    fn test_expire_before_and_summaries() {
        let caches = caches("v1");
        let mut old = entry("https://kiosk.example.org/api/users", "[]");
        old.stored_at = Utc::now() - Duration::days(2);
        caches.put("api-cache", &old).unwrap();
        caches.put("api-cache", &entry("https://kiosk.example.org/api/events", "[]")).unwrap();

        assert_eq!(caches.expire_before("api-cache", Utc::now() - Duration::days(1)).unwrap(), 1);
        assert_eq!(
            caches.summaries().unwrap(),
            vec![StoreSummary {
                version_tag: "v1".to_string(),
                store_name: "api-cache".to_string(),
                entries: 1,
            }]
        );
    }
}
