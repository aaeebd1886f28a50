//! Core types for the caching system.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Root prefix shared by every adapter's persisted entries.
pub const CACHE_PREFIX: &str = "specsync.cached";

/// Root prefix of the per-adapter eviction index records.
pub const LAST_MODIFIED_PREFIX: &str = "specsync.last_modified_time";

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
  /// Fresh data from network
  Network,
  /// Loaded from persistent storage
  Cache,
  /// Supplied directly by the host application
  Bootstrap,
  /// Network confirmed the cached payload is still current
  NetworkNotModified,
}

/// The unit of cached state.
///
/// `received_at` is the only freshness ordering key: a result is never
/// replaced by one with a smaller `received_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResult {
  /// Serialized specs, opaque to this crate
  pub payload: String,
  pub source: DataSource,
  /// Milliseconds since the unix epoch
  pub received_at: i64,
}

impl CachedResult {
  /// Create a result stamped with the current time.
  pub fn new(payload: impl Into<String>, source: DataSource) -> Self {
    Self {
      payload: payload.into(),
      source,
      received_at: now_ms(),
    }
  }

  /// Create a result from fresh network data.
  pub fn from_network(payload: impl Into<String>) -> Self {
    Self::new(payload, DataSource::Network)
  }

  /// Re-stamp a previously held payload after a not-modified response.
  pub fn not_modified(previous: &CachedResult) -> Self {
    Self::new(previous.payload.clone(), DataSource::NetworkNotModified)
  }

  /// Whether this result may replace `current` under the freshness rule.
  pub fn is_at_least_as_fresh_as(&self, current: &CachedResult) -> bool {
    self.received_at >= current.received_at
  }

  /// Decode a persisted record. Anything malformed is treated as absent.
  pub fn decode(raw: &str) -> Option<Self> {
    serde_json::from_str(raw).ok()
  }

  pub fn encode(&self) -> String {
    // A struct of strings and integers cannot fail to serialize.
    serde_json::to_string(self).unwrap_or_default()
  }
}

/// Caller-facing fetch hint, forwarded to the network fetcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchPriority {
  High,
  Low,
  #[default]
  Auto,
}

impl FetchPriority {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::High => "high",
      Self::Low => "low",
      Self::Auto => "auto",
    }
  }
}

/// Options accepted by the async data operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
  pub priority: Option<FetchPriority>,
}

impl FetchOptions {
  pub fn with_priority(priority: FetchPriority) -> Self {
    Self {
      priority: Some(priority),
    }
  }
}

/// Storage key derivation: `{CACHE_PREFIX}.{suffix}.{hash(sdk_key)}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn new(suffix: &str, sdk_key: &str) -> Self {
    Self(format!("{}{}", Self::adapter_prefix(suffix), hash_sdk_key(sdk_key)))
  }

  /// Prefix shared by every key of one adapter kind, including the trailing dot.
  pub fn adapter_prefix(suffix: &str) -> String {
    format!("{}.{}.", CACHE_PREFIX, suffix)
  }

  /// Key of the eviction index record for one adapter kind.
  pub fn last_modified_index(suffix: &str) -> String {
    format!("{}.{}", LAST_MODIFIED_PREFIX, suffix)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for CacheKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// SHA256 hash for stable, fixed-length keys that survive restarts.
fn hash_sdk_key(sdk_key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(sdk_key.as_bytes());
  hex::encode(hasher.finalize())
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> i64 {
  chrono::Utc::now().timestamp_millis()
}
