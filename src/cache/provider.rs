//! Process-wide storage provider with a one-way fallback to memory.
//!
//! Exactly one backend is active at a time. The provider starts on whatever
//! backend it was built with (usually [`SqliteStorage`]) and switches to a
//! fresh [`MemoryStorage`] the first time that backend reports
//! [`StorageError::PermissionDenied`]. The switch is never undone and nothing
//! is migrated across.
//!
//! Build one provider per process and hand the same `Arc` to every adapter so
//! they all observe the same switch.

use color_eyre::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use super::storage::{MemoryStorage, SqliteStorage, StorageBackend, StorageError};
use crate::config::{StorageBackendKind, StorageConfig};

pub struct StorageProvider {
  active: RwLock<Arc<dyn StorageBackend>>,
  fell_back: AtomicBool,
  /// Per-record locks for read-modify-write sequences shared across adapters
  record_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StorageProvider {
  pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
    Self {
      active: RwLock::new(backend),
      fell_back: AtomicBool::new(false),
      record_locks: Mutex::new(HashMap::new()),
    }
  }

  pub fn in_memory() -> Self {
    Self::new(Arc::new(MemoryStorage::new()))
  }

  /// Build the provider described by the storage section of the config.
  ///
  /// A persistent medium that cannot be opened for lack of permission yields
  /// an already fallen-back in-memory provider. Other open failures are
  /// returned.
  pub fn from_config(config: &StorageConfig) -> Result<Self> {
    match config.backend {
      StorageBackendKind::Memory => Ok(Self::in_memory()),
      StorageBackendKind::Sqlite => {
        let opened = match &config.path {
          Some(path) => SqliteStorage::open_at(path),
          None => SqliteStorage::open(),
        };
        match opened {
          Ok(storage) => Ok(Self::new(Arc::new(storage))),
          Err(report) => match report.downcast_ref::<StorageError>() {
            Some(StorageError::PermissionDenied(reason)) => {
              warn!(reason = %reason, "persistent storage unavailable, using in-memory storage");
              let provider = Self::in_memory();
              provider.fell_back.store(true, Ordering::Release);
              Ok(provider)
            }
            _ => Err(report),
          },
        }
      }
    }
  }

  /// Exclusive access to the record at `key` for a read-modify-write.
  ///
  /// Holds across every adapter sharing this provider.
  pub async fn lock_record(&self, key: &str) -> OwnedMutexGuard<()> {
    let lock = {
      let mut locks = match self.record_locks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
      };
      Arc::clone(locks.entry(key.to_string()).or_default())
    };
    lock.lock_owned().await
  }

  /// Name of the active backend.
  pub fn provider_name(&self) -> &'static str {
    self.backend().name()
  }

  /// Whether the permission fallback has happened.
  pub fn has_fallen_back(&self) -> bool {
    self.fell_back.load(Ordering::Acquire)
  }

  fn backend(&self) -> Arc<dyn StorageBackend> {
    match self.active.read() {
      Ok(guard) => Arc::clone(&guard),
      Err(poisoned) => Arc::clone(&poisoned.into_inner()),
    }
  }

  /// Swap to memory exactly once, however many callers fail concurrently.
  fn switch_to_memory(&self, reason: &str) {
    if self
      .fell_back
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return;
    }

    let memory: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
    match self.active.write() {
      Ok(mut guard) => *guard = memory,
      Err(poisoned) => *poisoned.into_inner() = memory,
    }
    warn!(reason, "persistent storage unavailable, using in-memory storage");
  }

  /// Absorb a backend failure: permission errors trigger the fallback,
  /// anything else is only logged.
  fn absorb(&self, op: &str, key: &str, err: StorageError) {
    match err {
      StorageError::PermissionDenied(reason) => self.switch_to_memory(&reason),
      other => debug!(op, key, error = %other, "storage operation failed"),
    }
  }

  async fn run_blocking<T, F>(&self, op: F) -> Result<T, StorageError>
  where
    T: Send + 'static,
    F: FnOnce(&dyn StorageBackend) -> Result<T, StorageError> + Send + 'static,
  {
    let backend = self.backend();
    tokio::task::spawn_blocking(move || op(backend.as_ref()))
      .await
      .map_err(|e| StorageError::Backend(format!("storage task failed: {}", e)))?
  }

  pub async fn get(&self, key: &str) -> Option<String> {
    let owned = key.to_string();
    match self.run_blocking(move |b| b.get(&owned)).await {
      Ok(value) => value,
      Err(e) => {
        self.absorb("get", key, e);
        None
      }
    }
  }

  /// Synchronous read, for callers that cannot await.
  ///
  /// Returns `None` when the active backend does not support sync reads.
  pub fn get_sync(&self, key: &str) -> Option<String> {
    let backend = self.backend();
    if !backend.supports_sync_get() {
      return None;
    }
    match backend.get(key) {
      Ok(value) => value,
      Err(e) => {
        self.absorb("get_sync", key, e);
        None
      }
    }
  }

  /// Write a value. Permission failures succeed as a no-op after switching.
  pub async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
    let (owned_key, owned_value) = (key.to_string(), value.to_string());
    match self
      .run_blocking(move |b| b.set(&owned_key, &owned_value))
      .await
    {
      Ok(()) => Ok(()),
      Err(StorageError::PermissionDenied(reason)) => {
        self.switch_to_memory(&reason);
        Ok(())
      }
      Err(e) => {
        debug!(key, error = %e, "storage write failed");
        Err(e)
      }
    }
  }

  pub async fn remove(&self, key: &str) {
    let owned = key.to_string();
    if let Err(e) = self.run_blocking(move |b| b.remove(&owned)).await {
      self.absorb("remove", key, e);
    }
  }

  pub async fn list_keys(&self) -> Vec<String> {
    match self.run_blocking(|b| b.list_keys()).await {
      Ok(keys) => keys,
      Err(e) => {
        self.absorb("list_keys", "*", e);
        Vec::new()
      }
    }
  }
}

impl Default for StorageProvider {
  fn default() -> Self {
    Self::in_memory()
  }
}
