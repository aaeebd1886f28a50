//! Generic fetch, cache and persist engine.
//!
//! This module is domain-agnostic. It provides:
//! - A pluggable key-value storage provider that falls back to memory for the
//!   rest of the process when persistent storage is denied
//! - A bounded in-memory index ordered by `received_at`, never by arrival
//! - Single-flight network fetches with not-modified handling
//! - Basic offline mode (serve cached data when the network is unavailable)
//! - Startup warming of the in-memory index from storage

mod layer;
mod memory;
mod network;
mod provider;
mod storage;
mod traits;
mod warming;

pub use layer::{AdapterBinding, AdapterOptions, DataAdapterCore, DEFAULT_PERSISTED_LIMIT};
pub use memory::{InMemoryCache, DEFAULT_IN_MEMORY_LIMIT};
pub use network::{FetchOutcome, NetworkError, NetworkFetcher};
pub use provider::StorageProvider;
pub use storage::{MemoryStorage, SqliteStorage, StorageBackend, StorageError};
pub use traits::{
  now_ms, CacheKey, CachedResult, DataSource, FetchOptions, FetchPriority, CACHE_PREFIX,
  LAST_MODIFIED_PREFIX,
};
pub use warming::{warm_caching_from_storage, CacheWarming};
