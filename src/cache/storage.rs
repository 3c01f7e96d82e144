//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::key::RequestKey;
use super::traits::CachedResponse;
use crate::request::Response;

/// One stored entry, without its body.
#[derive(Debug, Clone)]
pub struct EntrySummary {
  pub method: String,
  pub url: String,
  pub status: u16,
  pub size: usize,
  pub stored_at: DateTime<Utc>,
}

/// Trait for partitioned cache storage backends.
///
/// A store belongs to one scope (site origin) and only ever sees that
/// scope's partitions. Each partition maps request identities to responses.
/// Writes to the same key overwrite; entries only disappear when their
/// partition is deleted.
pub trait CacheStorage: Send + Sync {
  /// The scope this store reads and writes.
  fn scope(&self) -> &str;

  /// Create the partition if it does not exist.
  fn open_partition(&self, name: &str) -> Result<()>;

  fn has_partition(&self, name: &str) -> Result<bool>;

  /// All partition names, oldest first.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Delete a partition and every entry in it. Returns false if it was absent.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Look up a request in one partition.
  fn match_in(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Look up a request across all partitions, oldest partition first.
  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store a response, creating the partition if needed.
  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store a batch of responses atomically: either all are written or none.
  fn put_all(&self, partition: &str, batch: &[(RequestKey, Response)]) -> Result<()>;

  /// List the entries of a partition.
  fn entries(&self, partition: &str) -> Result<Vec<EntrySummary>>;
}

/// SQLite-based cache storage implementation.
///
/// Several scopes can share one database file; see [`SqliteStorage::for_scope`].
pub struct SqliteStorage {
  conn: Arc<Mutex<Connection>>,
  scope: String,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS partitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (scope, name)
);

CREATE TABLE IF NOT EXISTS entries (
    partition_id INTEGER NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition_id, key_hash),
    FOREIGN KEY (partition_id) REFERENCES partitions(id) ON DELETE CASCADE
);

-- Lifecycle state per controller version
CREATE TABLE IF NOT EXISTS registrations (
    scope TEXT NOT NULL,
    version TEXT NOT NULL,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (scope, version)
);
"#;

impl SqliteStorage {
  /// Open or create the cache database at the given path, for one scope.
  pub fn open(path: &Path, scope: &str) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn, scope)
  }

  /// Open an in-memory database for testing.
  #[cfg(test)]
  pub fn open_in_memory(scope: &str) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn, scope)
  }

  fn with_connection(conn: Connection, scope: &str) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
      scope: scope.to_string(),
    })
  }

  /// A handle on the same database that sees another scope's partitions.
  pub fn for_scope(&self, scope: &str) -> Self {
    Self {
      conn: Arc::clone(&self.conn),
      scope: scope.to_string(),
    }
  }

  pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn ensure_partition(&self, conn: &Connection, name: &str) -> Result<i64> {
    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (scope, name) VALUES (?, ?)",
        params![self.scope, name],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", name, e))?;

    conn
      .query_row(
        "SELECT id FROM partitions WHERE scope = ? AND name = ?",
        params![self.scope, name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read partition {}: {}", name, e))
  }

  fn store(
    conn: &Connection,
    partition_id: i64,
    key: &RequestKey,
    response: &Response,
  ) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entries (partition_id, key_hash, method, url, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          partition_id,
          key.cache_hash(),
          key.method(),
          key.url(),
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

    Ok(())
  }
}

fn row_to_cached(
  partition: String,
  status: u16,
  headers: String,
  body: Vec<u8>,
  stored_at: String,
) -> Result<CachedResponse> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize stored headers: {}", e))?;
  Ok(CachedResponse {
    response: Response {
      status,
      headers,
      body,
    },
    partition,
    stored_at: parse_datetime(&stored_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn scope(&self) -> &str {
    &self.scope
  }

  fn open_partition(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    self.ensure_partition(&conn, name)?;
    Ok(())
  }

  fn has_partition(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT id FROM partitions WHERE scope = ? AND name = ?",
        params![self.scope, name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up partition {}: {}", name, e))?;
    Ok(found.is_some())
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM partitions WHERE scope = ? ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map(params![self.scope], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM partitions WHERE scope = ? AND name = ?",
        params![self.scope, name],
      )
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;
    Ok(removed > 0)
  }

  fn match_in(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT e.status, e.headers, e.body, e.stored_at
         FROM entries e
         INNER JOIN partitions p ON p.id = e.partition_id
         WHERE p.scope = ? AND p.name = ? AND e.key_hash = ?",
        params![self.scope, partition, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", key, partition, e))?;

    match row {
      Some((status, headers, body, stored_at)) => Ok(Some(row_to_cached(
        partition.to_string(),
        status,
        headers,
        body,
        stored_at,
      )?)),
      None => Ok(None),
    }
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT p.name, e.status, e.headers, e.body, e.stored_at
         FROM entries e
         INNER JOIN partitions p ON p.id = e.partition_id
         WHERE p.scope = ? AND e.key_hash = ?
         ORDER BY p.id
         LIMIT 1",
        params![self.scope, key.cache_hash()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    match row {
      Some((partition, status, headers, body, stored_at)) => Ok(Some(row_to_cached(
        partition, status, headers, body, stored_at,
      )?)),
      None => Ok(None),
    }
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    let id = self.ensure_partition(&conn, partition)?;
    Self::store(&conn, id, key, response)
      .map_err(|e| eyre!("Failed to write to {}: {}", partition, e))
  }

  fn put_all(&self, partition: &str, batch: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let id = self.ensure_partition(&tx, partition)?;
    for (key, response) in batch {
      Self::store(&tx, id, key, response)
        .map_err(|e| eyre!("Failed to write to {}: {}", partition, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit {} to {}: {}", batch.len(), partition, e))
  }

  fn entries(&self, partition: &str) -> Result<Vec<EntrySummary>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT e.method, e.url, e.status, length(e.body), e.stored_at
         FROM entries e
         INNER JOIN partitions p ON p.id = e.partition_id
         WHERE p.scope = ? AND p.name = ?
         ORDER BY e.url",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, u16, i64, String)> = stmt
      .query_map(params![self.scope, partition], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", partition, e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(method, url, status, size, stored_at)| {
        Ok(EntrySummary {
          method,
          url,
          status,
          size: usize::try_from(size).unwrap_or_default(),
          stored_at: parse_datetime(&stored_at)?,
        })
      })
      .collect()
  }
}

/// Parse a datetime string from SQLite format.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
