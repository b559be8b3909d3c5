//! Persistence for queued mutations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use url::Url;

use super::domain::Domain;
use crate::db::{format_timestamp, parse_timestamp, Database};
use crate::net::{Method, Request};

static MUTATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Time-derived id: creation millis plus a process-wide counter.
fn next_mutation_id(now: DateTime<Utc>) -> String {
  format!(
    "{}-{}",
    now.timestamp_millis(),
    MUTATION_COUNTER.fetch_add(1, Ordering::SeqCst)
  )
}

/// A write waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
  pub id: String,
  pub store_name: String,
  pub domain: Domain,
  pub method: Method,
  pub url: Url,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub created_at: DateTime<Utc>,
}

impl QueuedMutation {
  /// Capture a request that could not be delivered.
  pub fn from_request(domain: Domain, request: &Request, now: DateTime<Utc>) -> Self {
    Self {
      id: next_mutation_id(now),
      store_name: domain.store_name().to_string(),
      domain,
      method: request.method,
      url: request.url.clone(),
      headers: request.headers.clone(),
      body: request.body.clone(),
      created_at: now,
    }
  }

  /// The request replay re-issues.
  pub fn to_request(&self) -> Request {
    Request {
      method: self.method,
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// A row as read back. Rows that no longer decode are surfaced rather than
/// failing the whole read, so one corrupt entry cannot block a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedMutation {
  Valid(QueuedMutation),
  Malformed { id: String, reason: String },
}

/// Queue tables in the shared database.
#[derive(Clone)]
pub struct QueueStorage {
  db: Arc<Database>,
}

impl QueueStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  pub fn push(&self, mutation: &QueuedMutation) -> Result<()> {
    let headers = serde_json::to_string(&mutation.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    self
      .db
      .lock()?
      .execute(
        "INSERT INTO queued_mutations (id, store_name, domain, method, url, headers, body, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          mutation.id,
          mutation.store_name,
          mutation.domain.as_str(),
          mutation.method.as_str(),
          mutation.url.as_str(),
          headers,
          mutation.body,
          format_timestamp(mutation.created_at)
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue into {}: {}", mutation.store_name, e))?;

    Ok(())
  }

  /// Every row of a store in insertion order.
  pub fn load(&self, store: &str) -> Result<Vec<LoadedMutation>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, domain, method, url, headers, body, created_at
         FROM queued_mutations WHERE store_name = ? ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows = stmt
      .query_map(params![store], |row| {
        Ok(RawRow {
          id: row.get(0)?,
          domain: row.get(1)?,
          method: row.get(2)?,
          url: row.get(3)?,
          headers: row.get(4)?,
          body: row.get(5)?,
          created_at: row.get(6)?,
        })
      })
      .map_err(|e| eyre!("Failed to read queue {}: {}", store, e))?
      .collect::<rusqlite::Result<Vec<RawRow>>>()
      .map_err(|e| eyre!("Failed to read queue {}: {}", store, e))?;

    Ok(
      rows
        .into_iter()
        .map(|row| {
          let id = row.id.clone();
          match row.decode(store) {
            Ok(mutation) => LoadedMutation::Valid(mutation),
            Err(e) => LoadedMutation::Malformed {
              id,
              reason: e.to_string(),
            },
          }
        })
        .collect(),
    )
  }

  pub fn remove(&self, store: &str, id: &str) -> Result<bool> {
    let removed = self
      .db
      .lock()?
      .execute(
        "DELETE FROM queued_mutations WHERE store_name = ? AND id = ?",
        params![store, id],
      )
      .map_err(|e| eyre!("Failed to remove {} from {}: {}", id, store, e))?;
    Ok(removed > 0)
  }

  pub fn count(&self, store: &str) -> Result<usize> {
    let count: i64 = self
      .db
      .lock()?
      .query_row(
        "SELECT COUNT(*) FROM queued_mutations WHERE store_name = ?",
        params![store],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count queue {}: {}", store, e))?;
    Ok(count as usize)
  }

  pub fn purge(&self, store: &str) -> Result<usize> {
    self
      .db
      .lock()?
      .execute(
        "DELETE FROM queued_mutations WHERE store_name = ?",
        params![store],
      )
      .map_err(|e| eyre!("Failed to purge queue {}: {}", store, e))
  }
}

struct RawRow {
  id: String,
  domain: String,
  method: String,
  url: String,
  headers: String,
  body: Vec<u8>,
  created_at: String,
}

impl RawRow {
  fn decode(self, store: &str) -> Result<QueuedMutation> {
    let domain: Domain = self.domain.parse()?;
    let method: Method = self.method.parse()?;
    let url = Url::parse(&self.url).map_err(|e| eyre!("Invalid url '{}': {}", self.url, e))?;
    let headers: BTreeMap<String, String> =
      serde_json::from_str(&self.headers).map_err(|e| eyre!("Invalid headers: {}", e))?;
    let created_at = parse_timestamp(&self.created_at)?;

    Ok(QueuedMutation {
      id: self.id,
      store_name: store.to_string(),
      domain,
      method,
      url,
      headers,
      body: self.body,
      created_at,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
  }

  fn mutation(path: &str) -> QueuedMutation {
    let request = Request::post_json(
      Url::parse("https://example.org").unwrap().join(path).unwrap(),
      &serde_json::json!({"path": path}),
    )
    .unwrap();
    QueuedMutation::from_request(Domain::Generic, &request, now())
  }

  #[test]
  fn test_ids_are_unique_for_same_instant() {
    let a = mutation("/api/a");
    let b = mutation("/api/b");
    assert_ne!(a.id, b.id);
    assert!(a.id.starts_with(&now().timestamp_millis().to_string()));
  }

  #[test]
  fn test_push_load_preserves_order_and_content() {
    let storage = QueueStorage::new(Arc::new(Database::open_in_memory().unwrap()));
    let first = mutation("/api/a");
    let second = mutation("/api/b");
    storage.push(&first).unwrap();
    storage.push(&second).unwrap();

    let loaded = storage.load("offline-queue").unwrap();
    assert_eq!(
      loaded,
      vec![LoadedMutation::Valid(first), LoadedMutation::Valid(second)]
    );
    assert_eq!(storage.count("offline-queue").unwrap(), 2);
    assert_eq!(storage.count("gesture-pending").unwrap(), 0);
  }

  #[test]
  fn test_malformed_rows_are_reported_not_fatal() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let storage = QueueStorage::new(db.clone());
    storage.push(&mutation("/api/a")).unwrap();
    db.lock()
      .unwrap()
      .execute(
        "INSERT INTO queued_mutations (id, store_name, domain, method, url, headers, body, created_at)
         VALUES ('bad', 'offline-queue', 'generic', 'POST', 'https://example.org/x', '{not json', x'', 'now')",
        [],
      )
      .unwrap();

    let loaded = storage.load("offline-queue").unwrap();
    assert_eq!(loaded.len(), 2);
    assert!(matches!(loaded[0], LoadedMutation::Valid(_)));
    assert!(matches!(&loaded[1], LoadedMutation::Malformed { id, .. } if id == "bad"));
  }

  #[test]
  fn test_remove_and_purge() {
    let storage = QueueStorage::new(Arc::new(Database::open_in_memory().unwrap()));
    let a = mutation("/api/a");
    storage.push(&a).unwrap();
    storage.push(&mutation("/api/b")).unwrap();

    assert!(storage.remove("offline-queue", &a.id).unwrap());
    assert!(!storage.remove("offline-queue", &a.id).unwrap());
    assert_eq!(storage.purge("offline-queue").unwrap(), 1);
    assert_eq!(storage.count("offline-queue").unwrap(), 0);
  }
}
