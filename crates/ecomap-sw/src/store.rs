//! Versioned persistent store of request/response pairs.
//!
//! One SQLite database holds every store generation. A generation is a named
//! row in `stores`; its entries cascade away when the generation is deleted.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use ecomap_net::Response;
use http::Method;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::ServiceWorkerError;

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Key of a cached entry: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_ascii_uppercase(),
            url: url.to_string(),
        }
    }

    /// Key of a `GET` to `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers, in received order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: i64,
}

impl CacheEntry {
    /// Snapshot a response under `key`. Consumes the response body.
    pub fn from_response(key: &CacheKey, response: Response) -> Self {
        let status = response.status;
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: key.url.clone(),
            method: key.method.clone(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: response.bytes().to_vec(),
            cached_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }
}

/// Every store generation, backed by one SQLite connection.
#[derive(Clone)]
pub struct CacheStorage {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStorage").finish_non_exhaustive()
    }
}

impl CacheStorage {
    /// Open (or create) the store database at `path`.
    pub fn open_path(path: &Path) -> Result<Self, ServiceWorkerError> {
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened cache storage");
        Self::init(conn)
    }

    /// Create a store database that lives only as long as this value.
    pub fn in_memory() -> Result<Self, ServiceWorkerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ServiceWorkerError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let table_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
                [],
                |row| row.get::<_, i32>(0).map(|count| count > 0),
            )
            .unwrap_or(false);

        let version: i32 = if table_exists {
            conn.query_row(
                "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0)
        } else {
            0
        };

        if version < SCHEMA_VERSION {
            create_schema_v1(&conn)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ServiceWorkerError> {
        self.conn.lock().map_err(|_| ServiceWorkerError::StorePoisoned)
    }

    /// Open a store generation, creating it if it doesn't exist.
    pub fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        let conn = self.lock()?;
        let created = conn.execute(
            "INSERT OR IGNORE INTO stores (name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now().timestamp_millis()],
        )?;
        if created > 0 {
            debug!(store = %name, "Created store generation");
        }
        Ok(())
    }

    /// Check if a store generation exists.
    pub fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let conn = self.lock()?;
        let found = conn
            .query_row("SELECT 1 FROM stores WHERE name = ?1", [name], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Names of every store generation, oldest first.
    pub fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM stores ORDER BY created_at, name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Delete a store generation and all its entries.
    pub fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM stores WHERE name = ?1", [name])?;
        if removed > 0 {
            info!(store = %name, "Deleted store generation");
        }
        Ok(removed > 0)
    }

    /// Delete every generation not named in `keep`, one at a time. A failed
    /// delete is logged and skipped. Returns the names actually deleted.
    pub fn retain(&self, keep: &[String]) -> Result<Vec<String>, ServiceWorkerError> {
        let mut deleted = Vec::new();
        for name in self.keys()? {
            if keep.contains(&name) {
                continue;
            }
            match self.delete(&name) {
                Ok(true) => deleted.push(name),
                Ok(false) => {}
                Err(e) => warn!(store = %name, error = %e, "Failed to delete store generation"),
            }
        }
        Ok(deleted)
    }

    /// Delete every store generation. Returns how many were removed.
    pub fn clear_all(&self) -> Result<usize, ServiceWorkerError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM stores", [])?;
        info!(removed, "Cleared all store generations");
        Ok(removed)
    }

    /// Look up an entry in one store generation.
    pub fn match_request(
        &self,
        store: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT url, method, status, status_text, headers, body, cached_at
                 FROM entries WHERE store = ?1 AND method = ?2 AND url = ?3",
                params![store, key.method, key.url],
                read_entry,
            )
            .optional()?;
        row.map(decode_entry).transpose()
    }

    /// Store an entry, replacing any previous one under the same key.
    pub fn put(&self, store: &str, entry: &CacheEntry) -> Result<(), ServiceWorkerError> {
        self.put_all(store, std::slice::from_ref(entry))
    }

    /// Store several entries in one transaction: either all land or none do.
    pub fn put_all(&self, store: &str, entries: &[CacheEntry]) -> Result<(), ServiceWorkerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO stores (name, created_at) VALUES (?1, ?2)",
            params![store, Utc::now().timestamp_millis()],
        )?;
        for entry in entries {
            let headers = serde_json::to_string(&entry.headers)?;
            tx.execute(
                "INSERT OR REPLACE INTO entries
                 (store, method, url, status, status_text, headers, body, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    store,
                    entry.method,
                    entry.url,
                    entry.status,
                    entry.status_text,
                    headers,
                    entry.body,
                    entry.cached_at
                ],
            )?;
        }
        tx.commit()?;
        debug!(store = %store, count = entries.len(), "Stored entries");
        Ok(())
    }

    /// Delete one entry.
    pub fn delete_entry(&self, store: &str, key: &CacheKey) -> Result<bool, ServiceWorkerError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM entries WHERE store = ?1 AND method = ?2 AND url = ?3",
            params![store, key.method, key.url],
        )?;
        Ok(removed > 0)
    }

    /// Keys of every entry in one store generation.
    pub fn entry_keys(&self, store: &str) -> Result<Vec<CacheKey>, ServiceWorkerError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT method, url FROM entries WHERE store = ?1 ORDER BY url, method")?;
        let keys = stmt
            .query_map([store], |row| {
                Ok(CacheKey {
                    method: row.get(0)?,
                    url: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

type EntryRow = (String, String, u16, String, String, Vec<u8>, i64);

fn read_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_entry(row: EntryRow) -> Result<CacheEntry, ServiceWorkerError> {
    let (url, method, status, status_text, headers, body, cached_at) = row;
    Ok(CacheEntry {
        url,
        method,
        status,
        status_text,
        headers: serde_json::from_str(&headers)?,
        body,
        cached_at,
    })
}

/// Create initial schema (version 1)
fn create_schema_v1(conn: &Connection) -> Result<(), ServiceWorkerError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS stores (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            store TEXT NOT NULL REFERENCES stores(name) ON DELETE CASCADE,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            status INTEGER NOT NULL,
            status_text TEXT NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (store, method, url)
        );",
    )?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, Utc::now().timestamp_millis()],
    )?;

    Ok(())
}
