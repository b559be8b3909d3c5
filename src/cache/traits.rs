//! Core types describing where a routed response came from.

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::net::Response;

/// A served response, including metadata about the source.
#[derive(Debug)]
pub struct CacheResult {
  /// The response handed back to the caller
  pub data: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was stored (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// A store operation failed along the way and was skipped
  pub degraded: bool,
  /// Background refresh started by stale-while-revalidate; await it or drop it
  pub revalidation: Option<JoinHandle<()>>,
}

impl CacheResult {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: Response) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      degraded: false,
      revalidation: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: Response, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
      degraded: false,
      revalidation: None,
    }
  }

  /// Create a new cache result for a network failure served from cache.
  pub fn offline(data: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
      degraded: false,
      revalidation: None,
    }
  }

  pub fn degraded(mut self, degraded: bool) -> Self {
    self.degraded = degraded;
    self
  }

  pub fn with_revalidation(mut self, handle: JoinHandle<()>) -> Self {
    self.revalidation = Some(handle);
    self
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still within its max age
  CacheFresh,
  /// Data from cache past its max age, served while a refresh runs
  CacheStale,
  /// Network failed, serving cached data
  Offline,
}
