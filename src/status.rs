//! User-visible sync indicator.
//!
//! `idle -> syncing -> {success, error} -> idle`, with the terminal state held
//! for a display window before reverting. Overlapping syncs share one
//! indicator: it stays `syncing` until the last one finishes and ends in
//! `error` if any of them failed.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::db::{format_timestamp, parse_timestamp, Database};

const LAST_SYNC_KEY: &str = "last-sync-time";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  Idle,
  Syncing,
  Success,
  Error,
}

/// Snapshot read by the foreground.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
  pub status: SyncStatus,
  /// Best-effort count of queued mutations
  pub pending_count: usize,
  pub last_sync_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Batch {
  active: usize,
  failed: bool,
  /// Bumped on every transition so a stale auto-revert can tell it lost the race
  generation: u64,
}

pub struct SyncStatusController {
  tx: watch::Sender<SyncSession>,
  batch: Mutex<Batch>,
  display_window: Duration,
  db: Arc<Database>,
  clock: Arc<dyn Clock>,
}

impl SyncStatusController {
  /// Create the controller in `idle`, restoring the persisted last sync time.
  pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, display_window: Duration) -> Arc<Self> {
    let last_sync_time = match db.kv_get(LAST_SYNC_KEY) {
      Ok(Some(raw)) => parse_timestamp(&raw)
        .map_err(|e| warn!("Ignoring stored last sync time: {}", e))
        .ok(),
      Ok(None) => None,
      Err(e) => {
        warn!("Failed to read last sync time: {}", e);
        None
      }
    };

    let (tx, _rx) = watch::channel(SyncSession {
      status: SyncStatus::Idle,
      pending_count: 0,
      last_sync_time,
    });

    Arc::new(Self {
      tx,
      batch: Mutex::new(Batch::default()),
      display_window,
      db,
      clock,
    })
  }

  pub fn subscribe(&self) -> watch::Receiver<SyncSession> {
    self.tx.subscribe()
  }

  pub fn snapshot(&self) -> SyncSession {
    self.tx.borrow().clone()
  }

  /// Replace the pending count, e.g. after recounting the queues at startup.
  pub fn set_pending(&self, count: usize) {
    self.tx.send_modify(|s| s.pending_count = count);
  }

  pub fn record_enqueued(&self) {
    self.tx.send_modify(|s| s.pending_count += 1);
  }

  pub fn record_delivered(&self, count: usize) {
    self
      .tx
      .send_modify(|s| s.pending_count = s.pending_count.saturating_sub(count));
  }

  /// A sync started.
  pub fn begin(&self) {
    {
      let mut batch = self.lock_batch();
      batch.active += 1;
      batch.generation += 1;
    }
    self.tx.send_modify(|s| s.status = SyncStatus::Syncing);
  }

  /// A sync finished. Once no sync is running, show the outcome and schedule
  /// the return to idle.
  pub fn finish(self: &Arc<Self>, ok: bool) {
    let (generation, failed) = {
      let mut batch = self.lock_batch();
      batch.active = batch.active.saturating_sub(1);
      batch.failed |= !ok;
      if batch.active > 0 {
        return;
      }
      batch.generation += 1;
      (batch.generation, std::mem::take(&mut batch.failed))
    };

    if failed {
      self.tx.send_modify(|s| s.status = SyncStatus::Error);
    } else {
      let now = self.clock.now();
      if let Err(e) = self.persist_last_sync(now) {
        warn!("Failed to persist last sync time: {}", e);
      }
      self.tx.send_modify(|s| {
        s.status = SyncStatus::Success;
        s.last_sync_time = Some(now);
      });
    }

    let controller = Arc::clone(self);
    tokio::spawn(async move {
      tokio::time::sleep(controller.display_window).await;
      controller.revert_to_idle(generation);
    });
  }

  fn revert_to_idle(&self, generation: u64) {
    let batch = self.lock_batch();
    if batch.generation != generation || batch.active > 0 {
      debug!("Skipping status revert, a newer sync owns the indicator");
      return;
    }
    self.tx.send_modify(|s| s.status = SyncStatus::Idle);
  }

  fn persist_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
    self.db.kv_set(LAST_SYNC_KEY, &format_timestamp(at))
  }

  fn lock_batch(&self) -> MutexGuard<'_, Batch> {
    self.batch.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;

  fn controller() -> (Arc<SyncStatusController>, Arc<Database>, Arc<ManualClock>) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new());
    let controller = SyncStatusController::new(db.clone(), clock.clone(), Duration::from_secs(3));
    (controller, db, clock)
  }

  #[tokio::test(start_paused = true)]
  async fn test_success_reverts_to_idle_after_window() {
    let (status, _, clock) = controller();
    assert_eq!(status.snapshot().status, SyncStatus::Idle);

    status.begin();
    assert_eq!(status.snapshot().status, SyncStatus::Syncing);

    status.finish(true);
    let session = status.snapshot();
    assert_eq!(session.status, SyncStatus::Success);
    assert_eq!(session.last_sync_time, Some(clock.now()));

    tokio::time::sleep(Duration::from_millis(2900)).await;
    assert_eq!(status.snapshot().status, SyncStatus::Success);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(status.snapshot().status, SyncStatus::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_error_does_not_touch_last_sync_time() {
    let (status, _, _) = controller();
    status.begin();
    status.finish(false);

    let session = status.snapshot();
    assert_eq!(session.status, SyncStatus::Error);
    assert_eq!(session.last_sync_time, None);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(status.snapshot().status, SyncStatus::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_overlapping_syncs_share_indicator() {
    let (status, _, _) = controller();
    status.begin();
    status.begin();

    status.finish(false);
    assert_eq!(status.snapshot().status, SyncStatus::Syncing);

    status.finish(true);
    assert_eq!(status.snapshot().status, SyncStatus::Error);
  }

  #[tokio::test(start_paused = true)]
  async fn test_new_sync_cancels_pending_revert() {
    let (status, _, _) = controller();
    status.begin();
    status.finish(true);

    tokio::time::sleep(Duration::from_secs(2)).await;
    status.begin();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // The first revert fired at 3s but a sync is running.
    assert_eq!(status.snapshot().status, SyncStatus::Syncing);
  }

  #[tokio::test]
  async fn test_last_sync_time_survives_restart() {
    let (status, db, clock) = controller();
    status.begin();
    status.finish(true);

    let restarted = SyncStatusController::new(db, clock.clone(), Duration::from_secs(3));
    let session = restarted.snapshot();
    assert_eq!(session.status, SyncStatus::Idle);
    assert_eq!(session.last_sync_time, Some(clock.now()));
  }

  #[test]
  fn test_pending_count_bookkeeping() {
    let (status, _, _) = controller();
    status.set_pending(2);
    status.record_enqueued();
    status.record_delivered(2);
    assert_eq!(status.snapshot().pending_count, 1);

    status.record_delivered(5);
    assert_eq!(status.snapshot().pending_count, 0);
  }

  #[tokio::test]
  async fn test_subscribers_see_transitions() {
    let (status, _, _) = controller();
    let mut rx = status.subscribe();

    status.begin();
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow_and_update().status, SyncStatus::Syncing);
  }

  #[test]
  fn test_session_serializes_camel_case() {
    let session = SyncSession {
      status: SyncStatus::Success,
      pending_count: 2,
      last_sync_time: None,
    };
    let json = serde_json::to_value(&session).unwrap();
    assert_eq!(json["status"], "success");
    assert_eq!(json["pendingCount"], 2);
    assert!(json["lastSyncTime"].is_null());
  }
}
