//! Adapter engine that coordinates network fetches, the in-memory index and
//! persistent storage.
//!
//! Every write into the in-memory index goes through the freshness rule (see
//! [`InMemoryCache::install`]), so the order in which overlapping fetches,
//! storage loads and cache warming complete never matters. At most one
//! network fetch is outstanding per adapter; callers arriving while it runs
//! share its outcome.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use super::memory::{InMemoryCache, DEFAULT_IN_MEMORY_LIMIT};
use super::network::{FetchOutcome, NetworkError, NetworkFetcher};
use super::provider::StorageProvider;
use super::traits::{now_ms, CacheKey, CachedResult, DataSource, FetchOptions};
use super::warming::{warm_caching_from_storage, CacheWarming};
use crate::config::CacheConfig;

pub const DEFAULT_PERSISTED_LIMIT: usize = 10;

/// Tuning applied when an adapter is attached.
#[derive(Debug, Clone, Copy)]
pub struct AdapterOptions {
  /// Maximum number of keys held in memory
  pub in_memory_limit: usize,
  /// Maximum number of keys this adapter kind keeps in storage
  pub persisted_limit: usize,
}

impl Default for AdapterOptions {
  fn default() -> Self {
    Self {
      in_memory_limit: DEFAULT_IN_MEMORY_LIMIT,
      persisted_limit: DEFAULT_PERSISTED_LIMIT,
    }
  }
}

impl From<&CacheConfig> for AdapterOptions {
  fn from(config: &CacheConfig) -> Self {
    Self {
      in_memory_limit: config.in_memory_limit,
      persisted_limit: config.persisted_limit,
    }
  }
}

/// Domain-specific pieces of an adapter.
#[async_trait]
pub trait AdapterBinding: Send + Sync + 'static {
  /// Tag that keeps this adapter kind's keys apart from other kinds.
  fn cache_suffix(&self) -> &'static str;

  /// Whether `cached` may be retained when the server answers not-modified.
  fn is_valid_for_not_modified(&self, cached: &CachedResult) -> bool;

  /// Map a fetch onto the concrete network call.
  async fn fetch_from_network(
    &self,
    network: &dyn NetworkFetcher,
    sdk_key: &str,
    options: &FetchOptions,
  ) -> Result<FetchOutcome, NetworkError>;
}

type Flight = Shared<BoxFuture<'static, Option<CachedResult>>>;

/// The outstanding fetch. Aborted when the attachment it serves goes away.
struct InFlight {
  id: u64,
  flight: Flight,
  abort: AbortHandle,
}

struct Attachment {
  sdk_key: String,
  cache_key: CacheKey,
  network: Arc<dyn NetworkFetcher>,
  epoch: u64,
}

struct AdapterState {
  attachment: Option<Arc<Attachment>>,
  /// Bumped on every attach and detach; flights compare against it
  epoch: u64,
  in_flight: Option<InFlight>,
  next_flight_id: u64,
  memory: InMemoryCache,
  persisted_limit: usize,
}

struct Inner<B> {
  name: &'static str,
  binding: B,
  storage: Arc<StorageProvider>,
  state: Mutex<AdapterState>,
  /// Serializes persistence so a stale write cannot land after a fresh one
  write_lock: tokio::sync::Mutex<()>,
  pending_writes: Mutex<Vec<JoinHandle<()>>>,
}

/// Fetch, cache and persist engine shared by every adapter kind.
pub struct DataAdapterCore<B: AdapterBinding> {
  inner: Arc<Inner<B>>,
}

impl<B: AdapterBinding> Clone for DataAdapterCore<B> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<B: AdapterBinding> DataAdapterCore<B> {
  pub fn new(name: &'static str, binding: B, storage: Arc<StorageProvider>) -> Self {
    Self {
      inner: Arc::new(Inner {
        name,
        binding,
        storage,
        state: Mutex::new(AdapterState {
          attachment: None,
          epoch: 0,
          in_flight: None,
          next_flight_id: 0,
          memory: InMemoryCache::default(),
          persisted_limit: DEFAULT_PERSISTED_LIMIT,
        }),
        write_lock: tokio::sync::Mutex::new(()),
        pending_writes: Mutex::new(Vec::new()),
      }),
    }
  }

  pub fn name(&self) -> &'static str {
    self.inner.name
  }

  pub fn binding(&self) -> &B {
    &self.inner.binding
  }

  pub fn storage(&self) -> &Arc<StorageProvider> {
    &self.inner.storage
  }

  /// Prefix shared by every persisted key of this adapter kind.
  pub fn cache_prefix(&self) -> String {
    CacheKey::adapter_prefix(self.inner.binding.cache_suffix())
  }

  /// Cache key for the attached sdk key.
  pub fn cache_key(&self) -> Option<CacheKey> {
    let state = self.inner.lock_state();
    state.attachment.as_ref().map(|a| a.cache_key.clone())
  }

  pub fn is_attached(&self) -> bool {
    self.inner.lock_state().attachment.is_some()
  }

  /// Bind the adapter to an sdk key and a network handle.
  ///
  /// Anything already primed into memory is kept. A fetch still running for
  /// the previous attachment is aborted, so fetches never overlap.
  pub fn attach(&self, sdk_key: &str, options: AdapterOptions, network: Arc<dyn NetworkFetcher>) {
    let cache_key = CacheKey::new(self.inner.binding.cache_suffix(), sdk_key);
    let mut state = self.inner.lock_state();

    state.epoch += 1;
    let epoch = state.epoch;
    state.abort_flight();
    state.memory.pin(Some(cache_key.as_str()));
    state.memory.set_limit(options.in_memory_limit);
    state.persisted_limit = options.persisted_limit.max(1);
    state.attachment = Some(Arc::new(Attachment {
      sdk_key: sdk_key.to_string(),
      cache_key,
      network,
      epoch,
    }));

    debug!(adapter = self.inner.name, "attached");
  }

  /// Tear down: results of fetches still in flight are discarded.
  pub fn detach(&self) {
    let mut state = self.inner.lock_state();
    state.epoch += 1;
    state.attachment = None;
    state.abort_flight();
    state.memory.pin(None);
    debug!(adapter = self.inner.name, "detached");
  }

  /// Detach and wait for writes that were already scheduled.
  pub async fn shutdown(&self) {
    self.detach();
    self.flush_writes().await;
  }

  /// Wait for every scheduled persistence write to finish.
  pub async fn flush_writes(&self) {
    let handles: Vec<JoinHandle<()>> = match self.inner.pending_writes.lock() {
      Ok(mut pending) => pending.drain(..).collect(),
      Err(poisoned) => poisoned.into_inner().drain(..).collect(),
    };

    for handle in handles {
      if let Err(e) = handle.await {
        warn!(adapter = self.inner.name, error = %e, "persistence task failed");
      }
    }
  }

  /// Current in-memory result for an arbitrary key.
  pub fn cached_result(&self, key: &str) -> Option<CachedResult> {
    self.inner.lock_state().memory.get(key).cloned()
  }

  /// Read without awaiting: memory first, then a synchronous storage read
  /// when the active storage supports one.
  pub fn get_data_sync(&self) -> Option<CachedResult> {
    let key = self.cache_key()?;
    if let Some(result) = self.cached_result(key.as_str()) {
      return Some(result);
    }

    let raw = self.inner.storage.get_sync(key.as_str())?;
    let loaded = self.inner.decode_persisted(key.as_str(), &raw)?;
    self.inner.install(key.as_str(), loaded)
  }

  /// Install host-supplied data. Bootstrap data is never persisted.
  pub fn set_data(&self, payload: impl Into<String>) -> Option<CachedResult> {
    let Some(key) = self.cache_key() else {
      warn!(adapter = self.inner.name, "set_data called before attach");
      return None;
    };
    self
      .inner
      .install(key.as_str(), CachedResult::new(payload, DataSource::Bootstrap))
  }

  /// Return the freshest data available after one network round trip.
  ///
  /// `current` is the caller's baseline for a not-modified answer. Callers
  /// arriving while a fetch is running join it instead of starting another.
  /// Failures degrade to the best cached result, or `None`.
  pub async fn get_data_async(
    &self,
    current: Option<CachedResult>,
    options: &FetchOptions,
  ) -> Option<CachedResult> {
    let flight = self.start_or_join(current, *options)?;
    flight.await
  }

  /// Start a fetch in the background without waiting for it.
  pub fn prefetch_data(&self, options: FetchOptions) {
    let _ = self.start_or_join(None, options);
  }

  /// Install a batch of results, each under the freshness rule.
  ///
  /// Returns how many entries were applied.
  pub fn prime_in_memory_cache(&self, entries: HashMap<String, CachedResult>) -> usize {
    let mut state = self.inner.lock_state();
    let total = entries.len();
    let applied = entries
      .into_iter()
      .filter(|(key, result)| state.memory.install(key, result.clone()))
      .count();

    debug!(
      adapter = self.inner.name,
      applied,
      skipped = total - applied,
      "primed in-memory cache"
    );
    applied
  }

  /// Warm the in-memory index from everything this adapter kind persisted.
  pub fn warm_from_storage(&self) -> CacheWarming {
    warm_caching_from_storage(self)
  }

  fn start_or_join(&self, current: Option<CachedResult>, options: FetchOptions) -> Option<Flight> {
    let mut state = self.inner.lock_state();
    if let Some(in_flight) = &state.in_flight {
      return Some(in_flight.flight.clone());
    }

    let Some(attachment) = state.attachment.clone() else {
      debug!(adapter = self.inner.name, "fetch requested before attach");
      return None;
    };

    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      warn!(adapter = self.inner.name, "fetch requested outside a tokio runtime");
      return None;
    };

    state.next_flight_id += 1;
    let flight_id = state.next_flight_id;

    let inner = Arc::clone(&self.inner);
    let task = runtime.spawn(async move {
      let result = inner.run_flight(&attachment, current, options).await;
      inner.finish_flight(flight_id);
      result
    });

    let abort = task.abort_handle();
    let name = self.inner.name;
    let flight = async move {
      match task.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => {
          debug!(adapter = name, "fetch aborted");
          None
        }
        Err(e) => {
          warn!(adapter = name, error = %e, "fetch task failed");
          None
        }
      }
    }
    .boxed()
    .shared();

    state.in_flight = Some(InFlight {
      id: flight_id,
      flight: flight.clone(),
      abort,
    });
    Some(flight)
  }
}

impl AdapterState {
  fn abort_flight(&mut self) {
    if let Some(in_flight) = self.in_flight.take() {
      in_flight.abort.abort();
    }
  }

  fn is_current(&self, attachment: &Attachment) -> bool {
    self.epoch == attachment.epoch
  }
}

impl<B: AdapterBinding> Inner<B> {
  fn lock_state(&self) -> MutexGuard<'_, AdapterState> {
    match self.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn install(&self, key: &str, result: CachedResult) -> Option<CachedResult> {
    let mut state = self.lock_state();
    state.memory.install(key, result);
    state.memory.get(key).cloned()
  }

  fn decode_persisted(&self, key: &str, raw: &str) -> Option<CachedResult> {
    match CachedResult::decode(raw) {
      Some(result) => Some(CachedResult {
        source: DataSource::Cache,
        ..result
      }),
      None => {
        debug!(adapter = self.name, key, "ignoring malformed cache entry");
        None
      }
    }
  }

  /// Seed memory from storage, unless the attachment went away meanwhile.
  async fn load_from_storage(&self, attachment: &Attachment) -> Option<CachedResult> {
    let key = attachment.cache_key.as_str();
    let raw = self.storage.get(key).await?;
    let loaded = self.decode_persisted(key, &raw)?;

    let mut state = self.lock_state();
    if !state.is_current(attachment) {
      return None;
    }
    state.memory.install(key, loaded);
    state.memory.get(key).cloned()
  }

  fn finish_flight(&self, flight_id: u64) {
    let mut state = self.lock_state();
    if matches!(&state.in_flight, Some(in_flight) if in_flight.id == flight_id) {
      state.in_flight = None;
    }
  }

  /// The whole of one fetch: pick a baseline, hit the network, apply.
  async fn run_flight(
    self: &Arc<Self>,
    attachment: &Attachment,
    current: Option<CachedResult>,
    options: FetchOptions,
  ) -> Option<CachedResult> {
    let key = attachment.cache_key.as_str();

    let held = self.lock_state().memory.get(key).cloned();
    let baseline = match current.or(held) {
      Some(result) => Some(result),
      None => self.load_from_storage(attachment).await,
    };
    if !self.lock_state().is_current(attachment) {
      debug!(adapter = self.name, "detached before the network fetch");
      return None;
    }

    let outcome = self
      .binding
      .fetch_from_network(
        attachment.network.as_ref(),
        &attachment.sdk_key,
        &options,
      )
      .await;

    let incoming = match outcome {
      Ok(FetchOutcome::Updated(payload)) => CachedResult::from_network(payload),
      Ok(FetchOutcome::NotModified) => {
        match baseline
          .as_ref()
          .filter(|b| self.binding.is_valid_for_not_modified(b))
        {
          Some(previous) => CachedResult::not_modified(previous),
          None => {
            warn!(adapter = self.name, "not-modified response without a usable cached payload");
            return self.best_available(attachment, key, baseline);
          }
        }
      }
      Err(e) => {
        warn!(adapter = self.name, error = %e, "network fetch failed");
        return self.best_available(attachment, key, baseline);
      }
    };

    let applied = {
      let mut state = self.lock_state();
      if !state.is_current(attachment) {
        debug!(adapter = self.name, "discarding fetch result after detach");
        return None;
      }
      let applied = state.memory.install(key, incoming.clone());
      (applied, state.memory.get(key).cloned())
    };

    match applied {
      (true, held) => {
        self.spawn_persist(key.to_string(), incoming);
        held
      }
      (false, held) => {
        debug!(adapter = self.name, "fetched result older than held result");
        held
      }
    }
  }

  fn best_available(
    &self,
    attachment: &Attachment,
    key: &str,
    baseline: Option<CachedResult>,
  ) -> Option<CachedResult> {
    let state = self.lock_state();
    if !state.is_current(attachment) {
      return None;
    }
    state.memory.get(key).cloned().or(baseline)
  }

  fn spawn_persist(self: &Arc<Self>, key: String, result: CachedResult) {
    let inner = Arc::clone(self);
    let handle = tokio::spawn(async move { inner.persist(&key, result).await });

    let mut pending = match self.pending_writes.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    pending.retain(|h| !h.is_finished());
    pending.push(handle);
  }

  async fn persist(&self, key: &str, result: CachedResult) {
    let _guard = self.write_lock.lock().await;

    let persisted_limit = {
      let state = self.lock_state();
      if let Some(held) = state.memory.get(key) {
        if held.received_at > result.received_at {
          // a fresher write is queued behind us
          return;
        }
      }
      state.persisted_limit
    };

    if let Err(e) = self.storage.set(key, &result.encode()).await {
      warn!(adapter = self.name, key, error = %e, "failed to persist result");
      return;
    }

    self.track_and_evict(key, persisted_limit).await;
  }

  /// Record the write time of `key` and drop the oldest persisted keys of
  /// this adapter kind beyond `limit`.
  ///
  /// The index is shared by every adapter of this kind on the same storage,
  /// so the read-modify-write runs under the provider's lock for it.
  async fn track_and_evict(&self, key: &str, limit: usize) {
    let index_key = CacheKey::last_modified_index(self.binding.cache_suffix());
    let _index_guard = self.storage.lock_record(&index_key).await;
    let mut index: HashMap<String, i64> = match self.storage.get(&index_key).await {
      Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
      None => HashMap::new(),
    };
    index.insert(key.to_string(), now_ms());

    if index.len() > limit {
      let mut by_age: Vec<(String, i64)> = index
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, t)| (k.clone(), *t))
        .collect();
      by_age.sort_by_key(|(_, t)| *t);

      let excess = index.len() - limit;
      for (evicted, _) in by_age.into_iter().take(excess) {
        self.storage.remove(&evicted).await;
        index.remove(&evicted);
        debug!(adapter = self.name, key = %evicted, "evicted persisted entry");
      }
    }

    match serde_json::to_string(&index) {
      Ok(raw) => {
        if let Err(e) = self.storage.set(&index_key, &raw).await {
          debug!(adapter = self.name, error = %e, "failed to write eviction index");
        }
      }
      Err(e) => debug!(adapter = self.name, error = %e, "failed to encode eviction index"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{MemoryStorage, StorageBackend, StorageError};
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::sync::Notify;

  struct TestBinding;

  #[async_trait]
  impl AdapterBinding for TestBinding {
    fn cache_suffix(&self) -> &'static str {
      "test"
    }

    fn is_valid_for_not_modified(&self, cached: &CachedResult) -> bool {
      !cached.payload.is_empty()
    }

    async fn fetch_from_network(
      &self,
      network: &dyn NetworkFetcher,
      sdk_key: &str,
      options: &FetchOptions,
    ) -> Result<FetchOutcome, NetworkError> {
      network.fetch(sdk_key, options.priority).await
    }
  }

  /// Replays scripted outcomes, optionally holding each call until released.
  #[derive(Default)]
  struct ScriptedFetcher {
    outcomes: Mutex<VecDeque<Result<FetchOutcome, NetworkError>>>,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
  }

  impl ScriptedFetcher {
    fn new(outcomes: Vec<Result<FetchOutcome, NetworkError>>) -> Self {
      Self {
        outcomes: Mutex::new(outcomes.into()),
        ..Default::default()
      }
    }

    fn gated(outcomes: Vec<Result<FetchOutcome, NetworkError>>, gate: Arc<Notify>) -> Self {
      Self {
        gate: Some(gate),
        ..Self::new(outcomes)
      }
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl NetworkFetcher for ScriptedFetcher {
    async fn fetch(
      &self,
      _sdk_key: &str,
      _priority: Option<crate::cache::FetchPriority>,
    ) -> Result<FetchOutcome, NetworkError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if let Some(gate) = &self.gate {
        gate.notified().await;
      }
      self
        .outcomes
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(Err(NetworkError::Transport("script exhausted".into())))
    }
  }

  fn adapter_with(
    fetcher: Arc<ScriptedFetcher>,
  ) -> (DataAdapterCore<TestBinding>, Arc<StorageProvider>) {
    let storage = Arc::new(StorageProvider::in_memory());
    let adapter = DataAdapterCore::new("TestAdapter", TestBinding, Arc::clone(&storage));
    adapter.attach("client-key", AdapterOptions::default(), fetcher);
    (adapter, storage)
  }

  fn updated(payload: &str) -> Result<FetchOutcome, NetworkError> {
    Ok(FetchOutcome::Updated(payload.to_string()))
  }

  fn cached(payload: &str, received_at: i64) -> CachedResult {
    CachedResult {
      payload: payload.into(),
      source: DataSource::Cache,
      received_at,
    }
  }

  #[tokio::test]
  async fn network_result_is_applied_and_persisted() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![updated("P1")]));
    let (adapter, storage) = adapter_with(fetcher.clone());

    let result = adapter
      .get_data_async(None, &FetchOptions::default())
      .await
      .unwrap();
    assert_eq!(result.payload, "P1");
    assert_eq!(result.source, DataSource::Network);

    adapter.flush_writes().await;
    let key = adapter.cache_key().unwrap();
    let raw = storage.get(key.as_str()).await.unwrap();
    assert_eq!(CachedResult::decode(&raw).unwrap(), result);
    assert_eq!(fetcher.calls(), 1);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_callers_share_one_fetch() {
    let gate = Arc::new(Notify::new());
    let fetcher = Arc::new(ScriptedFetcher::gated(vec![updated("P1")], gate.clone()));
    let (adapter, _) = adapter_with(fetcher.clone());
    let options = FetchOptions::default();

    let callers = futures::future::join_all((0..5).map(|_| adapter.get_data_async(None, &options)));
    let release = async {
      while fetcher.calls() == 0 {
        tokio::task::yield_now().await;
      }
      gate.notify_one();
    };
    let (results, ()) = tokio::join!(callers, release);

    assert_eq!(fetcher.calls(), 1);
    let first = results[0].clone().unwrap();
    assert_eq!(first.payload, "P1");
    assert!(results.iter().all(|r| r.as_ref() == Some(&first)));
  }

  #[tokio::test]
  async fn new_fetch_starts_after_previous_completes() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![updated("P1"), updated("P2")]));
    let (adapter, _) = adapter_with(fetcher.clone());

    let first = adapter.get_data_async(None, &FetchOptions::default()).await;
    let second = adapter.get_data_async(None, &FetchOptions::default()).await;

    assert_eq!(first.unwrap().payload, "P1");
    assert_eq!(second.unwrap().payload, "P2");
    assert_eq!(fetcher.calls(), 2);
  }

  #[tokio::test]
  async fn not_modified_retains_payload() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchOutcome::NotModified)]));
    let (adapter, _) = adapter_with(fetcher);
    let previous = cached("P1", 1);

    let result = adapter
      .get_data_async(Some(previous.clone()), &FetchOptions::default())
      .await
      .unwrap();

    assert_eq!(result.payload, "P1");
    assert_eq!(result.source, DataSource::NetworkNotModified);
    assert!(result.received_at > previous.received_at);
  }

  #[tokio::test]
  async fn not_modified_without_prior_data_is_a_failure() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchOutcome::NotModified)]));
    let (adapter, _) = adapter_with(fetcher);

    let result = adapter.get_data_async(None, &FetchOptions::default()).await;
    assert!(result.is_none());
    assert!(adapter.cached_result(adapter.cache_key().unwrap().as_str()).is_none());
  }

  #[tokio::test]
  async fn not_modified_with_empty_payload_degrades_to_baseline() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchOutcome::NotModified)]));
    let (adapter, _) = adapter_with(fetcher);
    let empty = cached("", 1);

    let result = adapter
      .get_data_async(Some(empty.clone()), &FetchOptions::default())
      .await;
    assert_eq!(result, Some(empty));
  }

  #[tokio::test]
  async fn network_failure_falls_back_to_persisted_entry() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![Err(NetworkError::Status(503))]));
    let (adapter, storage) = adapter_with(fetcher);
    let key = adapter.cache_key().unwrap();
    let persisted = CachedResult {
      payload: "P0".into(),
      source: DataSource::Network,
      received_at: 7,
    };
    storage.set(key.as_str(), &persisted.encode()).await.unwrap();

    let result = adapter
      .get_data_async(None, &FetchOptions::default())
      .await
      .unwrap();
    assert_eq!(result.payload, "P0");
    assert_eq!(result.source, DataSource::Cache);
    assert_eq!(result.received_at, 7);
  }

  #[tokio::test]
  async fn network_failure_without_cache_returns_none() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![Err(NetworkError::Transport(
      "connection refused".into(),
    ))]));
    let (adapter, storage) = adapter_with(fetcher);
    let key = adapter.cache_key().unwrap();
    storage.set(key.as_str(), "{ truncated").await.unwrap();

    assert!(adapter
      .get_data_async(None, &FetchOptions::default())
      .await
      .is_none());
  }

  #[tokio::test]
  async fn result_is_discarded_after_detach() {
    let gate = Arc::new(Notify::new());
    let fetcher = Arc::new(ScriptedFetcher::gated(vec![updated("P1")], gate.clone()));
    let (adapter, storage) = adapter_with(fetcher.clone());
    let key = adapter.cache_key().unwrap();

    let pending = {
      let adapter = adapter.clone();
      tokio::spawn(async move { adapter.get_data_async(None, &FetchOptions::default()).await })
    };
    while fetcher.calls() == 0 {
      tokio::task::yield_now().await;
    }

    adapter.detach();
    gate.notify_one();

    assert!(pending.await.unwrap().is_none());
    adapter.flush_writes().await;
    assert!(adapter.cached_result(key.as_str()).is_none());
    assert!(storage.get(key.as_str()).await.is_none());
  }

  #[tokio::test]
  async fn fresher_primed_entry_is_not_regressed_by_fetch() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![updated("stale")]));
    let (adapter, _) = adapter_with(fetcher);
    let key = adapter.cache_key().unwrap();
    let future = cached("future", now_ms() + 60_000);

    adapter.prime_in_memory_cache(HashMap::from([(key.to_string(), future.clone())]));
    let result = adapter.get_data_async(None, &FetchOptions::default()).await;

    assert_eq!(result, Some(future.clone()));
    assert_eq!(adapter.cached_result(key.as_str()), Some(future));
  }

  #[tokio::test]
  async fn prime_applies_only_fresher_entries() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
    let (adapter, _) = adapter_with(fetcher);

    adapter.prime_in_memory_cache(HashMap::from([("k".to_string(), cached("W2", 200))]));
    let applied = adapter.prime_in_memory_cache(HashMap::from([
      ("k".to_string(), cached("W1", 100)),
      ("other".to_string(), cached("X", 1)),
    ]));

    assert_eq!(applied, 1);
    assert_eq!(adapter.cached_result("k").unwrap().payload, "W2");
  }

  #[tokio::test]
  async fn bootstrap_data_is_served_sync_and_not_persisted() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
    let (adapter, storage) = adapter_with(fetcher);

    let installed = adapter.set_data("B1").unwrap();
    assert_eq!(installed.source, DataSource::Bootstrap);
    assert_eq!(adapter.get_data_sync(), Some(installed));

    adapter.flush_writes().await;
    assert!(storage.list_keys().await.is_empty());
  }

  #[tokio::test]
  async fn sync_read_falls_back_to_storage() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
    let (adapter, storage) = adapter_with(fetcher);
    let key = adapter.cache_key().unwrap();
    storage
      .set(key.as_str(), &cached("P0", 3).encode())
      .await
      .unwrap();

    let result = adapter.get_data_sync().unwrap();
    assert_eq!(result.payload, "P0");
    assert_eq!(result.source, DataSource::Cache);
  }

  #[tokio::test]
  async fn prefetch_populates_memory() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![updated("P1")]));
    let (adapter, _) = adapter_with(fetcher.clone());
    let key = adapter.cache_key().unwrap();

    adapter.prefetch_data(FetchOptions::default());
    // joins the prefetch instead of issuing a second request
    let result = adapter.get_data_async(None, &FetchOptions::default()).await;

    assert_eq!(result.unwrap().payload, "P1");
    assert_eq!(adapter.cached_result(key.as_str()).unwrap().payload, "P1");
    assert_eq!(fetcher.calls(), 1);
  }

  #[tokio::test]
  async fn persisted_entries_beyond_limit_are_evicted() {
    let storage = Arc::new(StorageProvider::in_memory());
    let options = AdapterOptions {
      in_memory_limit: 10,
      persisted_limit: 2,
    };
    let adapter = DataAdapterCore::new("TestAdapter", TestBinding, Arc::clone(&storage));

    let mut keys = Vec::new();
    for sdk_key in ["key-a", "key-b", "key-c"] {
      let fetcher = Arc::new(ScriptedFetcher::new(vec![updated(sdk_key)]));
      adapter.attach(sdk_key, options, fetcher);
      adapter.get_data_async(None, &FetchOptions::default()).await;
      adapter.flush_writes().await;
      keys.push(adapter.cache_key().unwrap());
      tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    assert!(storage.get(keys[0].as_str()).await.is_none());
    assert!(storage.get(keys[1].as_str()).await.is_some());
    assert!(storage.get(keys[2].as_str()).await.is_some());
  }

  #[tokio::test]
  async fn operations_before_attach_degrade_quietly() {
    let adapter = DataAdapterCore::new(
      "TestAdapter",
      TestBinding,
      Arc::new(StorageProvider::in_memory()),
    );

    assert!(adapter
      .get_data_async(None, &FetchOptions::default())
      .await
      .is_none());
    adapter.prefetch_data(FetchOptions::default());
    assert!(adapter.get_data_sync().is_none());
    assert!(adapter.set_data("B").is_none());
  }

  #[tokio::test]
  async fn attached_entry_survives_memory_pressure() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
    let storage = Arc::new(StorageProvider::in_memory());
    let adapter = DataAdapterCore::new("TestAdapter", TestBinding, storage);
    let options = AdapterOptions {
      in_memory_limit: 2,
      persisted_limit: 10,
    };
    adapter.attach("client-key", options, fetcher);
    let key = adapter.cache_key().unwrap().to_string();

    let fresh = adapter.set_data("fresh").unwrap();
    adapter.prime_in_memory_cache(HashMap::from([(
      "other-1".to_string(),
      cached("o1", fresh.received_at + 10),
    )]));
    adapter.prime_in_memory_cache(HashMap::from([(
      "other-2".to_string(),
      cached("o2", fresh.received_at + 20),
    )]));
    adapter.prime_in_memory_cache(HashMap::from([(key.clone(), cached("stale", 1))]));

    assert_eq!(adapter.cached_result(&key), Some(fresh));
    assert!(adapter.cached_result("other-1").is_none());
  }

  #[tokio::test]
  async fn late_persist_of_older_result_is_skipped() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
    let (adapter, storage) = adapter_with(fetcher);
    let key = adapter.cache_key().unwrap().to_string();
    let older = cached("older", 10);
    let newer = cached("newer", 20);

    let write_guard = adapter.inner.write_lock.lock().await;
    adapter.inner.install(&key, newer.clone());
    adapter.inner.spawn_persist(key.clone(), older);
    adapter.inner.spawn_persist(key.clone(), newer.clone());
    tokio::task::yield_now().await;
    drop(write_guard);
    adapter.flush_writes().await;

    let raw = storage.get(&key).await.unwrap();
    assert_eq!(CachedResult::decode(&raw), Some(newer));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn adapters_sharing_storage_keep_one_eviction_index() {
    let storage = Arc::new(StorageProvider::in_memory());
    let sdk_keys = ["key-a", "key-b", "key-c", "key-d", "key-e", "key-f"];

    let adapters: Vec<_> = sdk_keys
      .iter()
      .map(|sdk_key| {
        let adapter = DataAdapterCore::new("TestAdapter", TestBinding, Arc::clone(&storage));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![updated(sdk_key)]));
        adapter.attach(sdk_key, AdapterOptions::default(), fetcher);
        adapter
      })
      .collect();

    let options = FetchOptions::default();
    futures::future::join_all(
      adapters
        .iter()
        .map(|adapter| adapter.get_data_async(None, &options)),
    )
    .await;
    for adapter in &adapters {
      adapter.flush_writes().await;
    }

    let index_key = CacheKey::last_modified_index("test");
    let index: HashMap<String, i64> =
      serde_json::from_str(&storage.get(&index_key).await.unwrap()).unwrap();
    for adapter in &adapters {
      assert!(index.contains_key(adapter.cache_key().unwrap().as_str()));
    }
    assert_eq!(index.len(), sdk_keys.len());
  }

  /// Memory backend whose reads block until released.
  struct HeldReadStorage {
    items: MemoryStorage,
    entered: std::sync::atomic::AtomicBool,
    release: Mutex<std::sync::mpsc::Receiver<()>>,
  }

  impl StorageBackend for HeldReadStorage {
    fn name(&self) -> &'static str {
      "HeldRead"
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
      self.entered.store(true, Ordering::SeqCst);
      let _ = self.release.lock().unwrap().recv();
      self.items.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
      self.items.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
      self.items.remove(key)
    }

    fn list_keys(&self) -> Result<Vec<String>, StorageError> {
      self.items.list_keys()
    }
  }

  #[tokio::test]
  async fn detach_during_storage_read_leaves_memory_untouched() {
    let (release, gate) = std::sync::mpsc::channel();
    let backend = Arc::new(HeldReadStorage {
      items: MemoryStorage::new(),
      entered: std::sync::atomic::AtomicBool::new(false),
      release: Mutex::new(gate),
    });
    let key = CacheKey::new("test", "client-key");
    backend.set(key.as_str(), &cached("P0", 5).encode()).unwrap();

    let storage = Arc::new(StorageProvider::new(backend.clone()));
    let fetcher = Arc::new(ScriptedFetcher::new(vec![updated("P1")]));
    let adapter = DataAdapterCore::new("TestAdapter", TestBinding, storage);
    adapter.attach("client-key", AdapterOptions::default(), fetcher.clone());

    let pending = {
      let adapter = adapter.clone();
      tokio::spawn(async move { adapter.get_data_async(None, &FetchOptions::default()).await })
    };
    while !backend.entered.load(Ordering::SeqCst) {
      tokio::task::yield_now().await;
    }

    adapter.detach();
    release.send(()).unwrap();

    assert!(pending.await.unwrap().is_none());
    assert!(adapter.cached_result(key.as_str()).is_none());
    assert_eq!(fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn reattach_aborts_the_previous_fetch() {
    let gate = Arc::new(Notify::new());
    let stalled = Arc::new(ScriptedFetcher::gated(vec![updated("old")], gate));
    let (adapter, _) = adapter_with(stalled.clone());

    let pending = {
      let adapter = adapter.clone();
      tokio::spawn(async move { adapter.get_data_async(None, &FetchOptions::default()).await })
    };
    while stalled.calls() == 0 {
      tokio::task::yield_now().await;
    }

    let fresh = Arc::new(ScriptedFetcher::new(vec![updated("new")]));
    adapter.attach("other-key", AdapterOptions::default(), fresh.clone());

    assert!(pending.await.unwrap().is_none());
    // the aborted task released its attachment, and with it the fetcher
    assert_eq!(Arc::strong_count(&stalled), 1);

    let result = adapter.get_data_async(None, &FetchOptions::default()).await;
    assert_eq!(result.unwrap().payload, "new");
    assert_eq!(fresh.calls(), 1);
  }
}
