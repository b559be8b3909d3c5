//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::{format_timestamp, parse_timestamp, Database};
use crate::net::Response;

/// One stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  /// Request identity (see `Request::identity`)
  pub key: String,
  pub store_name: String,
  /// Request URL, kept for inspection
  pub url: String,
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Trait for cache storage backends.
///
/// Each call is atomic on its own; callers must not assume a sequence of
/// calls is.
pub trait CacheStorage: Send + Sync {
  /// Get an entry by store and key, regardless of age.
  fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>>;

  /// Insert or overwrite an entry. Overwriting counts as a fresh insertion.
  /// Before inserting, the oldest-inserted entries are evicted so the store
  /// ends with at most `max_entries`. Returns how many entries were evicted.
  fn put(&self, entry: &CacheEntry, max_entries: usize) -> Result<usize>;

  /// Remove one entry. Returns whether it existed.
  fn delete(&self, store: &str, key: &str) -> Result<bool>;

  /// Keys of a store in insertion order, oldest first.
  fn keys(&self, store: &str) -> Result<Vec<String>>;

  /// Names of every store holding at least one entry.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Remove a whole store. Returns how many entries it held.
  fn drop_store(&self, store: &str) -> Result<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _store: &str, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _entry: &CacheEntry, _max_entries: usize) -> Result<usize> {
    Ok(0) // Discard
  }

  fn delete(&self, _store: &str, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn keys(&self, _store: &str) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn store_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn drop_store(&self, _store: &str) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.db.lock()?;

    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, status, headers, body, stored_at FROM cache_entries
         WHERE store_name = ? AND entry_key = ?",
        params![store, key],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} entry: {}", store, e))?;

    match row {
      Some((url, status, headers, body, stored_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        Ok(Some(CacheEntry {
          key: key.to_string(),
          store_name: store.to_string(),
          url,
          status,
          headers,
          body,
          stored_at: parse_timestamp(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, entry: &CacheEntry, max_entries: usize) -> Result<usize> {
    if max_entries == 0 {
      return Ok(0);
    }

    let conn = self.db.lock()?;
    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    // An overwrite is a fresh insertion: drop the old row so it gets a new seq.
    conn
      .execute(
        "DELETE FROM cache_entries WHERE store_name = ? AND entry_key = ?",
        params![entry.store_name, entry.key],
      )
      .map_err(|e| eyre!("Failed to replace entry: {}", e))?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE store_name = ?",
        params![entry.store_name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count {} entries: {}", entry.store_name, e))?;
    let count = count as usize;

    let mut evicted = 0;
    if count >= max_entries {
      let excess = count + 1 - max_entries;
      evicted = conn
        .execute(
          "DELETE FROM cache_entries WHERE seq IN (
             SELECT seq FROM cache_entries WHERE store_name = ? ORDER BY seq LIMIT ?
           )",
          params![entry.store_name, excess],
        )
        .map_err(|e| eyre!("Failed to evict from {}: {}", entry.store_name, e))?;
    }

    conn
      .execute(
        "INSERT INTO cache_entries (store_name, entry_key, url, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          entry.store_name,
          entry.key,
          entry.url,
          entry.status,
          headers,
          entry.body,
          format_timestamp(entry.stored_at)
        ],
      )
      .map_err(|e| eyre!("Failed to store entry: {}", e))?;

    Ok(evicted)
  }

  fn delete(&self, store: &str, key: &str) -> Result<bool> {
    let removed = self
      .db
      .lock()?
      .execute(
        "DELETE FROM cache_entries WHERE store_name = ? AND entry_key = ?",
        params![store, key],
      )
      .map_err(|e| eyre!("Failed to delete {} entry: {}", store, e))?;
    Ok(removed > 0)
  }

  fn keys(&self, store: &str) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT entry_key FROM cache_entries WHERE store_name = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![store], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list {} keys: {}", store, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to list {} keys: {}", store, e))?;

    Ok(keys)
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT store_name FROM cache_entries ORDER BY store_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to list stores: {}", e))?;

    Ok(names)
  }

  fn drop_store(&self, store: &str) -> Result<usize> {
    self
      .db
      .lock()?
      .execute(
        "DELETE FROM cache_entries WHERE store_name = ?",
        params![store],
      )
      .map_err(|e| eyre!("Failed to drop store {}: {}", store, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn entry(store: &str, key: &str) -> CacheEntry {
    CacheEntry {
      key: key.to_string(),
      store_name: store.to_string(),
      url: format!("https://example.org/{}", key),
      status: 200,
      headers: BTreeMap::from([("content-type".to_string(), "image/png".to_string())]),
      body: key.as_bytes().to_vec(),
      stored_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
  }

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  #[test]
  fn test_put_then_get() {
    let storage = storage();
    let e = entry("images-cache", "a");
    storage.put(&e, 10).unwrap();

    assert_eq!(storage.get("images-cache", "a").unwrap(), Some(e));
    assert_eq!(storage.get("fonts-cache", "a").unwrap(), None);
  }

  #[test]
  fn test_fifo_eviction_keeps_newest() {
    let storage = storage();
    let mut evicted = 0;
    for key in ["k1", "k2", "k3", "k4", "k5"] {
      evicted += storage.put(&entry("s", key), 3).unwrap();
    }

    assert_eq!(evicted, 2);
    assert_eq!(storage.keys("s").unwrap(), vec!["k3", "k4", "k5"]);
  }

  #[test]
  fn test_reads_do_not_affect_eviction_order() {
    let storage = storage();
    for key in ["k1", "k2", "k3"] {
      storage.put(&entry("s", key), 3).unwrap();
    }
    // Reading k1 must not protect it: eviction is by insertion, not access.
    storage.get("s", "k1").unwrap();
    storage.put(&entry("s", "k4"), 3).unwrap();

    assert_eq!(storage.keys("s").unwrap(), vec!["k2", "k3", "k4"]);
  }

  #[test]
  fn test_overwrite_moves_entry_to_newest() {
    let storage = storage();
    for key in ["k1", "k2", "k3"] {
      storage.put(&entry("s", key), 3).unwrap();
    }
    assert_eq!(storage.put(&entry("s", "k1"), 3).unwrap(), 0);
    storage.put(&entry("s", "k4"), 3).unwrap();

    assert_eq!(storage.keys("s").unwrap(), vec!["k3", "k1", "k4"]);
  }

  #[test]
  fn test_put_trims_store_already_over_bound() {
    let storage = storage();
    for key in ["k1", "k2", "k3", "k4"] {
      storage.put(&entry("s", key), 10).unwrap();
    }
    assert_eq!(storage.put(&entry("s", "k5"), 2).unwrap(), 3);
    assert_eq!(storage.keys("s").unwrap(), vec!["k4", "k5"]);
  }

  #[test]
  fn test_stores_are_isolated() {
    let storage = storage();
    storage.put(&entry("a", "k1"), 1).unwrap();
    storage.put(&entry("b", "k1"), 1).unwrap();
    storage.put(&entry("a", "k2"), 1).unwrap();

    assert_eq!(storage.keys("a").unwrap(), vec!["k2"]);
    assert_eq!(storage.keys("b").unwrap(), vec!["k1"]);
    assert_eq!(storage.store_names().unwrap(), vec!["a", "b"]);

    assert_eq!(storage.drop_store("a").unwrap(), 1);
    assert_eq!(storage.store_names().unwrap(), vec!["b"]);
  }

  #[test]
  fn test_delete() {
    let storage = storage();
    storage.put(&entry("s", "k"), 5).unwrap();
    assert!(storage.delete("s", "k").unwrap());
    assert!(!storage.delete("s", "k").unwrap());
  }

  #[test]
  fn test_zero_capacity_stores_nothing() {
    let storage = storage();
    storage.put(&entry("s", "k"), 0).unwrap();
    assert!(storage.keys("s").unwrap().is_empty());
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let storage = NoopStorage;
    storage.put(&entry("s", "k"), 5).unwrap();
    assert_eq!(storage.get("s", "k").unwrap(), None);
  }
}
