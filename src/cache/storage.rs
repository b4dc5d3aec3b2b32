//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use super::types::{CachedResponse, RequestIdentity};
use crate::net::ResponseSnapshot;

#[derive(Debug, Error)]
pub enum StorageError {
  #[error("cache database error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to encode cached headers: {0}")]
  Encoding(#[from] serde_json::Error),

  #[error("failed to create cache directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("could not determine data directory")]
  NoDataDir,

  #[error("cache lock poisoned")]
  Poisoned,

  #[error("cache namespace {0} does not exist")]
  UnknownNamespace(String),

  #[error("failed to parse datetime '{0}'")]
  Timestamp(String),
}

/// Trait for cache storage backends.
///
/// Every method is atomic on its own. A miss is `Ok(None)`, never an error.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the namespace if it does not exist yet.
  fn open(&self, namespace: &str) -> Result<(), StorageError>;

  /// Look up a single entry.
  fn get(
    &self,
    namespace: &str,
    key: &RequestIdentity,
  ) -> Result<Option<CachedResponse>, StorageError>;

  /// Write an entry, replacing any previous one. The namespace must exist.
  fn put(
    &self,
    namespace: &str,
    key: &RequestIdentity,
    response: &ResponseSnapshot,
  ) -> Result<(), StorageError>;

  /// Create the namespace and write every entry, or nothing at all.
  fn put_all(
    &self,
    namespace: &str,
    entries: &[(RequestIdentity, ResponseSnapshot)],
  ) -> Result<(), StorageError>;

  /// Drop a namespace and all its entries. Returns whether it existed.
  fn delete_namespace(&self, namespace: &str) -> Result<bool, StorageError>;

  fn list_namespaces(&self) -> Result<BTreeSet<String>, StorageError>;

  /// The namespace recorded as current by the last activation.
  fn current(&self) -> Result<Option<String>, StorageError>;

  fn set_current(&self, namespace: &str) -> Result<(), StorageError>;

  fn entry_count(&self, namespace: &str) -> Result<usize, StorageError>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self, StorageError> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDir {
        path: parent.to_path_buf(),
        source,
      })?;
    }

    Self::with_connection(Connection::open(&path)?)
  }

  /// A throwaway store that lives as long as the value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self, StorageError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, StorageError> {
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, StorageError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(StorageError::NoDataDir)?;

    Ok(data_dir.join("nexo-sw").join("cache.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self.conn.lock().map_err(|_| StorageError::Poisoned)
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per (namespace, request identity); last write wins
CREATE TABLE IF NOT EXISTS entries (
    namespace TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, request_hash)
);

-- Single-row pointer to the namespace that is current
CREATE TABLE IF NOT EXISTS registration (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    current_namespace TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

fn namespace_exists(conn: &Connection, namespace: &str) -> Result<bool, StorageError> {
  let found: Option<i64> = conn
    .query_row(
      "SELECT 1 FROM namespaces WHERE name = ?",
      params![namespace],
      |row| row.get(0),
    )
    .optional()?;
  Ok(found.is_some())
}

fn ensure_namespace(conn: &Connection, namespace: &str) -> Result<(), StorageError> {
  conn.execute(
    "INSERT OR IGNORE INTO namespaces (name) VALUES (?)",
    params![namespace],
  )?;
  Ok(())
}

fn write_entry(
  tx: &Transaction<'_>,
  namespace: &str,
  key: &RequestIdentity,
  response: &ResponseSnapshot,
) -> Result<(), StorageError> {
  let headers = serde_json::to_string(&response.headers)?;
  tx.execute(
    "INSERT OR REPLACE INTO entries
       (namespace, request_hash, url, status, status_text, headers, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
    params![
      namespace,
      key.cache_hash(),
      key.url().as_str(),
      response.status,
      response.status_text,
      headers,
      response.body,
    ],
  )?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, namespace: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;
    ensure_namespace(&conn, namespace)
  }

  fn get(
    &self,
    namespace: &str,
    key: &RequestIdentity,
  ) -> Result<Option<CachedResponse>, StorageError> {
    let conn = self.lock()?;

    let row: Option<(String, u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, status, status_text, headers, body, cached_at FROM entries
         WHERE namespace = ? AND request_hash = ?",
        params![namespace, key.cache_hash()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()?;

    match row {
      Some((url, status, status_text, headers, body, cached_at)) => Ok(Some(CachedResponse {
        response: ResponseSnapshot {
          url,
          status,
          status_text,
          headers: serde_json::from_str(&headers)?,
          body,
        },
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put(
    &self,
    namespace: &str,
    key: &RequestIdentity,
    response: &ResponseSnapshot,
  ) -> Result<(), StorageError> {
    let mut conn = self.lock()?;

    // A namespace deleted by activation must stay deleted, even if a
    // refresh started before the activation finishes afterwards.
    if !namespace_exists(&conn, namespace)? {
      return Err(StorageError::UnknownNamespace(namespace.to_string()));
    }

    let tx = conn.transaction()?;
    write_entry(&tx, namespace, key, response)?;
    tx.commit()?;
    Ok(())
  }

  fn put_all(
    &self,
    namespace: &str,
    entries: &[(RequestIdentity, ResponseSnapshot)],
  ) -> Result<(), StorageError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    ensure_namespace(&tx, namespace)?;
    for (key, response) in entries {
      write_entry(&tx, namespace, key, response)?;
    }

    tx.commit()?;
    Ok(())
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool, StorageError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    tx.execute("DELETE FROM entries WHERE namespace = ?", params![namespace])?;
    tx.execute(
      "DELETE FROM registration WHERE current_namespace = ?",
      params![namespace],
    )?;
    let removed = tx.execute("DELETE FROM namespaces WHERE name = ?", params![namespace])?;

    tx.commit()?;
    Ok(removed > 0)
  }

  fn list_namespaces(&self) -> Result<BTreeSet<String>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM namespaces")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<BTreeSet<String>, _>>()?;
    Ok(names)
  }

  fn current(&self) -> Result<Option<String>, StorageError> {
    let conn = self.lock()?;
    let current = conn
      .query_row(
        "SELECT current_namespace FROM registration WHERE id = 1",
        [],
        |row| row.get(0),
      )
      .optional()?;
    Ok(current)
  }

  fn set_current(&self, namespace: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;

    if !namespace_exists(&conn, namespace)? {
      return Err(StorageError::UnknownNamespace(namespace.to_string()));
    }

    conn.execute(
      "INSERT OR REPLACE INTO registration (id, current_namespace, updated_at)
       VALUES (1, ?, datetime('now'))",
      params![namespace],
    )?;
    Ok(())
  }

  fn entry_count(&self, namespace: &str) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM entries WHERE namespace = ?",
      params![namespace],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|_| StorageError::Timestamp(s.to_string()))
}
