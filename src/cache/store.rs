//! A named cache store bound to one policy's limits.

use chrono::Duration;
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, warn};

use super::policy::CachePolicy;
use super::storage::{CacheEntry, CacheStorage};
use crate::clock::Clock;
use crate::net::{Request, Response};

/// View of one store with its eviction limits and lazy expiry.
///
/// Expired entries stay on disk until a read notices them; a read at any age
/// beyond `max_age` treats the entry as absent and deletes it.
#[derive(Clone)]
pub struct NamedCacheStore {
  name: String,
  max_entries: usize,
  max_age: Duration,
  storage: Arc<dyn CacheStorage>,
  clock: Arc<dyn Clock>,
}

impl NamedCacheStore {
  pub fn new(
    name: &str,
    max_entries: usize,
    max_age: Duration,
    storage: Arc<dyn CacheStorage>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      name: name.to_string(),
      max_entries,
      max_age,
      storage,
      clock,
    }
  }

  /// The store a policy writes to, if it has one.
  pub fn for_policy(
    policy: &CachePolicy,
    storage: &Arc<dyn CacheStorage>,
    clock: &Arc<dyn Clock>,
  ) -> Option<Self> {
    let name = policy.store_name.as_deref()?;
    Some(Self::new(
      name,
      policy.max_entries,
      policy.max_age,
      Arc::clone(storage),
      Arc::clone(clock),
    ))
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_expired(&self, entry: &CacheEntry) -> bool {
    self.clock.now() - entry.stored_at > self.max_age
  }

  /// Read an unexpired entry. Expired entries are deleted and reported as a miss.
  pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    let Some(entry) = self.storage.get(&self.name, key)? else {
      return Ok(None);
    };

    if self.is_expired(&entry) {
      debug!(store = %self.name, url = %entry.url, "Expired entry treated as miss");
      if let Err(e) = self.storage.delete(&self.name, key) {
        warn!(store = %self.name, "Failed to purge expired entry: {}", e);
      }
      return Ok(None);
    }

    Ok(Some(entry))
  }

  /// Read an entry regardless of age.
  pub fn get_any(&self, key: &str) -> Result<Option<CacheEntry>> {
    self.storage.get(&self.name, key)
  }

  /// Store a response for `request`, evicting the oldest entries beyond the limit.
  pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
    let entry = CacheEntry {
      key: request.identity(),
      store_name: self.name.clone(),
      url: request.url.to_string(),
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      stored_at: self.clock.now(),
    };

    let evicted = self.storage.put(&entry, self.max_entries)?;
    if evicted > 0 {
      debug!(store = %self.name, evicted, "Evicted oldest entries");
    }
    Ok(())
  }

  pub fn invalidate(&self, key: &str) -> Result<bool> {
    self.storage.delete(&self.name, key)
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.storage.keys(&self.name)?.len())
  }
}
