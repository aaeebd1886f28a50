//! Storage backend trait with SQLite and in-memory implementations.

use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use rusqlite::{params, Connection, ErrorCode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Failures a backend can report for a single operation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  /// The medium refused access; callers switch to memory for the process.
  #[error("storage access denied: {0}")]
  PermissionDenied(String),
  #[error("storage backend failure: {0}")]
  Backend(String),
  #[error("storage lock poisoned")]
  Poisoned,
}

impl From<std::io::Error> for StorageError {
  fn from(e: std::io::Error) -> Self {
    if e.kind() == std::io::ErrorKind::PermissionDenied || is_read_only_fs(&e) {
      StorageError::PermissionDenied(e.to_string())
    } else {
      StorageError::Backend(e.to_string())
    }
  }
}

#[cfg(unix)]
fn is_read_only_fs(e: &std::io::Error) -> bool {
  // EROFS
  e.raw_os_error() == Some(30)
}

#[cfg(not(unix))]
fn is_read_only_fs(_e: &std::io::Error) -> bool {
  false
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    match e.sqlite_error_code() {
      Some(
        ErrorCode::PermissionDenied
        | ErrorCode::ReadOnly
        | ErrorCode::AuthorizationForStatementDenied
        | ErrorCode::CannotOpen,
      ) => StorageError::PermissionDenied(e.to_string()),
      _ => StorageError::Backend(e.to_string()),
    }
  }
}

/// Key-value medium behind the storage provider.
pub trait StorageBackend: Send + Sync {
  /// Short name used for diagnostics.
  fn name(&self) -> &'static str;

  fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

  fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

  fn remove(&self, key: &str) -> Result<(), StorageError>;

  fn list_keys(&self) -> Result<Vec<String>, StorageError>;

  /// Whether `get` is cheap enough to call from synchronous code paths.
  fn supports_sync_get(&self) -> bool {
    true
  }
}

/// Process-local storage. Used directly or as the fallback medium.
#[derive(Default)]
pub struct MemoryStorage {
  items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl StorageBackend for MemoryStorage {
  fn name(&self) -> &'static str {
    "InMemory"
  }

  fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
    let items = self.items.lock().map_err(|_| StorageError::Poisoned)?;
    Ok(items.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
    let mut items = self.items.lock().map_err(|_| StorageError::Poisoned)?;
    items.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    let mut items = self.items.lock().map_err(|_| StorageError::Poisoned)?;
    items.remove(key);
    Ok(())
  }

  fn list_keys(&self) -> Result<Vec<String>, StorageError> {
    let items = self.items.lock().map_err(|_| StorageError::Poisoned)?;
    Ok(items.keys().cloned().collect())
  }
}

/// SQLite-based persistent storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage database at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the storage database at `path`.
  ///
  /// Failures carry a [`StorageError`] so callers can tell a denied medium
  /// from a broken one.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(StorageError::from)
        .wrap_err("Failed to create storage directory")?;
    }

    let conn = Connection::open(path)
      .map_err(StorageError::from)
      .wrap_err_with(|| format!("Failed to open storage database at {}", path.display()))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("specsync").join("storage.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORAGE_SCHEMA)
      .map_err(StorageError::from)
      .wrap_err("Failed to run storage migrations")?;

    Ok(())
  }
}

const STORAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl StorageBackend for SqliteStorage {
  fn name(&self) -> &'static str {
    "Sqlite"
  }

  fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
    let mut stmt = conn.prepare("SELECT value FROM kv_store WHERE key = ?")?;

    match stmt.query_row(params![key], |row| row.get(0)) {
      Ok(value) => Ok(Some(value)),
      Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, written_at)
       VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }

  fn list_keys(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
    let mut stmt = conn.prepare("SELECT key FROM kv_store")?;

    let keys: Vec<String> = stmt
      .query_map([], |row| row.get(0))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }
}
