//! Startup warming of an adapter's in-memory index from persisted storage.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::layer::{AdapterBinding, DataAdapterCore};
use super::traits::{CachedResult, DataSource};

/// Handle to a warming run.
///
/// `is_resolved` can be polled from code that cannot await; `wait` resolves
/// once the run has finished, whether or not every entry loaded.
pub struct CacheWarming {
  task: Option<JoinHandle<()>>,
  resolved: Arc<AtomicBool>,
}

impl CacheWarming {
  pub fn is_resolved(&self) -> bool {
    self.resolved.load(Ordering::Acquire)
  }

  pub async fn wait(&mut self) {
    if let Some(task) = self.task.take() {
      if let Err(e) = task.await {
        warn!(error = %e, "cache warming task failed");
      }
    }
  }
}

/// Marks the run resolved however it ends.
struct ResolveOnDrop(Arc<AtomicBool>);

impl Drop for ResolveOnDrop {
  fn drop(&mut self) {
    self.0.store(true, Ordering::Release);
  }
}

/// Start warming `adapter` from storage on the current tokio runtime.
///
/// Every persisted key under the adapter's prefix is loaded and decoded;
/// undecodable entries are skipped. The survivors are tagged
/// [`DataSource::Cache`] and handed to
/// [`DataAdapterCore::prime_in_memory_cache`] as one batch.
pub fn warm_caching_from_storage<B: AdapterBinding>(adapter: &DataAdapterCore<B>) -> CacheWarming {
  let resolved = Arc::new(AtomicBool::new(false));

  let Ok(runtime) = tokio::runtime::Handle::try_current() else {
    warn!(adapter = adapter.name(), "cache warming requested outside a tokio runtime");
    resolved.store(true, Ordering::Release);
    return CacheWarming {
      task: None,
      resolved,
    };
  };

  let adapter = adapter.clone();
  let guard = ResolveOnDrop(Arc::clone(&resolved));
  let task = runtime.spawn(async move {
    let _guard = guard;
    let entries = load_persisted_entries(&adapter).await;
    adapter.prime_in_memory_cache(entries);
  });

  CacheWarming {
    task: Some(task),
    resolved,
  }
}

async fn load_persisted_entries<B: AdapterBinding>(
  adapter: &DataAdapterCore<B>,
) -> HashMap<String, CachedResult> {
  let storage = adapter.storage();
  let prefix = adapter.cache_prefix();

  let keys: Vec<String> = storage
    .list_keys()
    .await
    .into_iter()
    .filter(|key| key.starts_with(&prefix))
    .collect();

  let loaded = join_all(keys.into_iter().map(|key| async move {
    let raw = storage.get(&key).await?;
    match CachedResult::decode(&raw) {
      Some(result) => Some((
        key,
        CachedResult {
          source: DataSource::Cache,
          ..result
        },
      )),
      None => {
        debug!(key = %key, "skipping malformed cache entry during warm");
        None
      }
    }
  }))
  .await;

  loaded.into_iter().flatten().collect()
}
