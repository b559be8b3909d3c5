//! Log of requests that failed with nowhere to queue them.
//!
//! Records are retried on demand and pruned once older than the configured
//! age, whether or not a retry ever succeeded.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::clock::Clock;
use crate::db::Database;
use crate::net::{Method, Request, Transport};

const FAILED_SYNCS: &str = "failed-syncs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRetryRecord {
  pub url: Url,
  pub method: Method,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Vec<u8>,
  pub timestamp: DateTime<Utc>,
}

impl FailedRetryRecord {
  fn to_request(&self) -> Request {
    Request {
      method: self.method,
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
  pub succeeded: usize,
  pub remaining: usize,
}

pub struct FailedSyncLog {
  db: Arc<Database>,
  transport: Arc<dyn Transport>,
  clock: Arc<dyn Clock>,
  max_age: Duration,
}

impl FailedSyncLog {
  pub fn new(
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    max_age: Duration,
  ) -> Self {
    Self {
      db,
      transport,
      clock,
      max_age,
    }
  }

  pub fn record(&self, request: &Request) -> Result<()> {
    let record = FailedRetryRecord {
      url: request.url.clone(),
      method: request.method,
      headers: request.headers.clone(),
      body: request.body.clone(),
      timestamp: self.clock.now(),
    };
    let payload =
      serde_json::to_string(&record).map_err(|e| eyre!("Failed to serialize record: {}", e))?;
    self.db.list_push(FAILED_SYNCS, &payload)?;
    info!(method = %record.method, url = %record.url, "Recorded failed request");
    Ok(())
  }

  /// Readable records, oldest first.
  pub fn records(&self) -> Result<Vec<FailedRetryRecord>> {
    Ok(
      self
        .load()?
        .into_iter()
        .filter_map(|(_, record)| record)
        .collect(),
    )
  }

  /// Re-send every record once. Successes are removed; the rest stay until
  /// they succeed or age out.
  pub async fn retry(&self) -> Result<RetryReport> {
    let mut report = RetryReport::default();
    for (seq, record) in self.load()? {
      let Some(record) = record else {
        report.remaining += 1;
        continue;
      };
      match self.transport.send(record.to_request()).await {
        Ok(response) if response.is_success() => {
          self.db.list_remove(seq)?;
          report.succeeded += 1;
        }
        Ok(response) => {
          debug!(url = %record.url, status = response.status, "Retry rejected");
          report.remaining += 1;
        }
        Err(e) => {
          debug!(url = %record.url, "Retry failed: {}", e);
          report.remaining += 1;
        }
      }
    }
    info!(succeeded = report.succeeded, remaining = report.remaining, "Retried failed requests");
    Ok(report)
  }

  /// Remove records older than the maximum age, and any that no longer parse.
  pub fn cleanup(&self) -> Result<usize> {
    let now = self.clock.now();
    let mut removed = 0;
    for (seq, record) in self.load()? {
      let expired = match &record {
        Some(record) => now - record.timestamp > self.max_age,
        None => true,
      };
      if expired && self.db.list_remove(seq)? {
        removed += 1;
      }
    }
    if removed > 0 {
      info!(removed, "Pruned failed request log");
    }
    Ok(removed)
  }

  fn load(&self) -> Result<Vec<(i64, Option<FailedRetryRecord>)>> {
    Ok(
      self
        .db
        .list_items(FAILED_SYNCS)?
        .into_iter()
        .map(|(seq, payload)| {
          let record = serde_json::from_str(&payload)
            .map_err(|e| warn!(seq, "Unreadable failed request record: {}", e))
            .ok();
          (seq, record)
        })
        .collect(),
    )
  }
}
