//! Storage backends: SQLite for real use, a no-op one when caching is off.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::traits::{CacheEntry, CacheStorage, PendingMutation};

/// Storage implementation that doesn't keep anything.
/// Used when caching is disabled or the database cannot be opened.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn put(&self, _key: &str, _payload: &[u8]) -> Result<()> {
    Ok(()) // Discard
  }

  fn get(&self, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn clear(&self) -> Result<usize> {
    Ok(0)
  }

  fn purge_stale_namespaces(&self) -> Result<usize> {
    Ok(0)
  }

  fn enqueue_mutation(&self, _payload: &[u8]) -> Result<i64> {
    // Accepting a write we cannot keep would lose it silently
    Err(eyre!("Durable storage unavailable, cannot queue request"))
  }

  fn list_mutations(&self) -> Result<Vec<PendingMutation>> {
    Ok(Vec::new())
  }

  fn delete_mutation(&self, _id: i64) -> Result<()> {
    Ok(())
  }

  fn clear_mutations(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  /// Namespace of the entries this instance reads and writes
  cache_name: String,
}

impl SqliteStorage {
  /// Open the database at the default location.
  pub fn open(cache_name: &str) -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path, cache_name)
  }

  /// Open (or create) the database at `path`.
  pub fn open_at(path: &Path, cache_name: &str) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn, cache_name)
  }

  /// Open a throwaway in-memory database.
  pub fn open_in_memory(cache_name: &str) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn, cache_name)
  }

  fn from_connection(conn: Connection, cache_name: &str) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      cache_name: cache_name.to_string(),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("outpost").join("cache.db"))
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Cached response payloads, one row per request identity and cache namespace
CREATE TABLE IF NOT EXISTS cached_data (
    cache_name TEXT NOT NULL,
    key TEXT NOT NULL,
    data BLOB NOT NULL,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (cache_name, key)
);

-- Writes waiting for replay. AUTOINCREMENT keeps ids from being reused.
CREATE TABLE IF NOT EXISTS offline_mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data BLOB NOT NULL,
    timestamp TEXT NOT NULL
);
"#;

impl CacheStorage for SqliteStorage {
  fn put(&self, key: &str, payload: &[u8]) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cached_data (cache_name, key, data, timestamp)
         VALUES (?, ?, ?, ?)",
        params![self.cache_name, key, payload, format_datetime(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, timestamp FROM cached_data WHERE cache_name = ? AND key = ?",
        params![self.cache_name, key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((payload, timestamp)) => Ok(Some(CacheEntry {
        key: key.to_string(),
        payload,
        stored_at: parse_datetime(&timestamp)?,
      })),
      None => Ok(None),
    }
  }

  fn clear(&self) -> Result<usize> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM cached_data WHERE cache_name = ?",
        params![self.cache_name],
      )
      .map_err(|e| eyre!("Failed to clear cache: {}", e))
  }

  fn purge_stale_namespaces(&self) -> Result<usize> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM cached_data WHERE cache_name != ?",
        params![self.cache_name],
      )
      .map_err(|e| eyre!("Failed to purge old caches: {}", e))
  }

  fn enqueue_mutation(&self, payload: &[u8]) -> Result<i64> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT INTO offline_mutations (data, timestamp) VALUES (?, ?)",
        params![payload, format_datetime(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to queue mutation: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn list_mutations(&self) -> Result<Vec<PendingMutation>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT id, data, timestamp FROM offline_mutations ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(i64, Vec<u8>, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to query mutations: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read mutation: {}", e))?;

    rows
      .into_iter()
      .map(|(id, payload, timestamp)| {
        Ok(PendingMutation {
          id,
          payload,
          enqueued_at: parse_datetime(&timestamp)?,
        })
      })
      .collect()
  }

  fn delete_mutation(&self, id: i64) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM offline_mutations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete mutation {}: {}", id, e))?;

    Ok(())
  }

  fn clear_mutations(&self) -> Result<usize> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM offline_mutations", [])
      .map_err(|e| eyre!("Failed to clear mutations: {}", e))
  }
}

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp column (RFC 3339, UTC).
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
