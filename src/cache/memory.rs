//! Bounded in-memory index of cached results, keyed by cache key.

use std::collections::HashMap;

use super::traits::CachedResult;

pub const DEFAULT_IN_MEMORY_LIMIT: usize = 10;

#[derive(Debug)]
pub struct InMemoryCache {
  entries: HashMap<String, CachedResult>,
  /// `received_at` of evicted entries; older writes for these keys are refused
  evicted: HashMap<String, i64>,
  /// Never evicted while set
  pinned: Option<String>,
  limit: usize,
}

impl InMemoryCache {
  pub fn new(limit: usize) -> Self {
    Self {
      entries: HashMap::new(),
      evicted: HashMap::new(),
      pinned: None,
      limit: limit.max(1),
    }
  }

  /// Exempt `key` from eviction, replacing any previous pin.
  pub fn pin(&mut self, key: Option<&str>) {
    self.pinned = key.map(str::to_string);
  }

  pub fn get(&self, key: &str) -> Option<&CachedResult> {
    self.entries.get(key)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Install `result` unless a strictly fresher one is already held.
  ///
  /// Returns whether the write was applied.
  pub fn install(&mut self, key: &str, result: CachedResult) -> bool {
    if let Some(existing) = self.entries.get(key) {
      if !result.is_at_least_as_fresh_as(existing) {
        return false;
      }
    } else if let Some(&evicted_at) = self.evicted.get(key) {
      if result.received_at < evicted_at {
        return false;
      }
    }

    self.evicted.remove(key);
    self.entries.insert(key.to_string(), result);
    self.evict_over_limit(Some(key));
    true
  }

  /// Change the capacity, evicting the oldest entries if now over it.
  pub fn set_limit(&mut self, limit: usize) {
    self.limit = limit.max(1);
    self.evict_over_limit(None);
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.evicted.clear();
  }

  /// Drop the oldest entries, never `keep` or the pinned key.
  fn evict_over_limit(&mut self, keep: Option<&str>) {
    while self.entries.len() > self.limit {
      let pinned = self.pinned.as_deref();
      let oldest = self
        .entries
        .iter()
        .filter(|(key, _)| Some(key.as_str()) != keep && Some(key.as_str()) != pinned)
        .min_by_key(|(_, result)| result.received_at)
        .map(|(key, _)| key.clone());

      let Some(key) = oldest else {
        break;
      };
      if let Some(result) = self.entries.remove(&key) {
        self.evicted.insert(key, result.received_at);
      }
    }
  }
}

impl Default for InMemoryCache {
  fn default() -> Self {
    Self::new(DEFAULT_IN_MEMORY_LIMIT)
  }
}
