//! Specs data adapter: binds the adapter engine to the config-specs domain.

use async_trait::async_trait;
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::{
  AdapterBinding, AdapterOptions, CacheKey, CacheWarming, CachedResult, DataAdapterCore,
  FetchOptions, FetchOutcome, NetworkError, NetworkFetcher, StorageProvider,
};
use crate::config::Config;

use super::client::HttpSpecsFetcher;

/// Keeps specs entries apart from other adapter kinds in shared storage.
pub const SPECS_CACHE_SUFFIX: &str = "specs";

pub struct SpecsBinding;

#[async_trait]
impl AdapterBinding for SpecsBinding {
  fn cache_suffix(&self) -> &'static str {
    SPECS_CACHE_SUFFIX
  }

  fn is_valid_for_not_modified(&self, cached: &CachedResult) -> bool {
    // Simply having a cached payload makes it valid
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

/// Config-specs adapter with transparent caching and offline support.
#[derive(Clone)]
pub struct SpecsDataAdapter {
  core: DataAdapterCore<SpecsBinding>,
}

impl SpecsDataAdapter {
  pub fn new(storage: Arc<StorageProvider>) -> Self {
    Self {
      core: DataAdapterCore::new("SpecsDataAdapter", SpecsBinding, storage),
    }
  }

  /// Bind to an sdk key. Without a network handle, an HTTP fetcher is built
  /// from `options` (or the defaults).
  pub fn attach(
    &self,
    sdk_key: &str,
    options: Option<&Config>,
    network: Option<Arc<dyn NetworkFetcher>>,
  ) -> Result<()> {
    let defaults = Config::default();
    let config = options.unwrap_or(&defaults);

    let network: Arc<dyn NetworkFetcher> = match network {
      Some(network) => network,
      None => Arc::new(HttpSpecsFetcher::new(&config.api)?),
    };

    self
      .core
      .attach(sdk_key, AdapterOptions::from(&config.cache), network);
    Ok(())
  }

  pub fn detach(&self) {
    self.core.detach();
  }

  pub async fn shutdown(&self) {
    self.core.shutdown().await;
  }

  pub fn cache_key(&self) -> Option<CacheKey> {
    self.core.cache_key()
  }

  pub async fn get_data_async(
    &self,
    current: Option<CachedResult>,
    options: &FetchOptions,
  ) -> Option<CachedResult> {
    self.core.get_data_async(current, options).await
  }

  pub fn prefetch_data(&self, options: FetchOptions) {
    self.core.prefetch_data(options);
  }

  pub fn get_data_sync(&self) -> Option<CachedResult> {
    self.core.get_data_sync()
  }

  pub fn set_data(&self, payload: impl Into<String>) -> Option<CachedResult> {
    self.core.set_data(payload)
  }

  pub fn prime_in_memory_cache(&self, entries: HashMap<String, CachedResult>) -> usize {
    self.core.prime_in_memory_cache(entries)
  }

  pub fn warm_from_storage(&self) -> CacheWarming {
    self.core.warm_from_storage()
  }

  pub async fn flush_writes(&self) {
    self.core.flush_writes().await;
  }

  pub fn core(&self) -> &DataAdapterCore<SpecsBinding> {
    &self.core
  }
}
