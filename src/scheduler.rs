//! Symbolic sync triggers and the jobs bound to them.
//!
//! A tag is registered once, then fired by a manual request, by connectivity
//! returning, or by a periodic tick. Firing runs every job bound to the tag
//! concurrently and reports through the [`SyncStatusController`].

use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::UnknownVariant;
use crate::queue::ReplayReport;
use crate::status::SyncStatusController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncTag {
  OfflineQueue,
  GamificationSync,
  GestureSync,
  ContentSync,
}

impl SyncTag {
  pub const ALL: [SyncTag; 4] = [
    SyncTag::OfflineQueue,
    SyncTag::GamificationSync,
    SyncTag::GestureSync,
    SyncTag::ContentSync,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      SyncTag::OfflineQueue => "offline-queue",
      SyncTag::GamificationSync => "gamification-sync",
      SyncTag::GestureSync => "gesture-sync",
      SyncTag::ContentSync => "content-sync",
    }
  }
}

impl fmt::Display for SyncTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SyncTag {
  type Err = UnknownVariant;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    SyncTag::ALL
      .into_iter()
      .find(|t| t.as_str() == s)
      .ok_or_else(|| UnknownVariant::new("tag", s))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
  Manual,
  /// The host came back online
  Connectivity,
  /// Best-effort timer; gaps between ticks are arbitrary
  Periodic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagState {
  Unregistered,
  Registered,
  Firing,
  Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
  /// Fires once per connectivity restoration
  OneShot,
  Periodic { min_interval: Duration },
}

/// Which trigger mechanisms the host offers. Missing ones leave the tags
/// usable through manual firing only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
  pub background_sync: bool,
  pub periodic_sync: bool,
}

impl Default for HostCapabilities {
  fn default() -> Self {
    Self {
      background_sync: true,
      periodic_sync: true,
    }
  }
}

/// Work done when a tag fires.
pub trait SyncJob: Send + Sync {
  fn label(&self) -> String;
  fn run(&self) -> BoxFuture<'_, Result<JobReport>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobReport {
  Replay(ReplayReport),
  Content { refreshed: bool },
}

impl JobReport {
  /// Nothing was left behind.
  pub fn is_clean(&self) -> bool {
    match self {
      JobReport::Replay(report) => report.is_clean(),
      JobReport::Content { .. } => true,
    }
  }
}

/// Everything one firing produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagOutcome {
  pub tag: SyncTag,
  #[serde(skip)]
  pub source: TriggerSource,
  pub reports: Vec<JobReport>,
  /// Jobs that could not run at all, e.g. an unreadable queue
  pub errors: Vec<String>,
}

impl TagOutcome {
  pub fn is_success(&self) -> bool {
    self.errors.is_empty() && self.reports.iter().all(JobReport::is_clean)
  }

  pub fn replays(&self) -> impl Iterator<Item = &ReplayReport> {
    self.reports.iter().filter_map(|r| match r {
      JobReport::Replay(report) => Some(report),
      JobReport::Content { .. } => None,
    })
  }
}

/// One-shot tags with work waiting to go out. Shared with the queues, which
/// request their tag whenever they accept an entry.
#[derive(Debug, Clone, Default)]
pub struct SyncIntents(Arc<Mutex<BTreeSet<SyncTag>>>);

impl SyncIntents {
  pub fn request(&self, tag: SyncTag) {
    if self.lock().insert(tag) {
      debug!(%tag, "Sync requested");
    }
  }

  pub fn pending(&self) -> Vec<SyncTag> {
    self.lock().iter().copied().collect()
  }

  fn clear(&self, tag: SyncTag) {
    self.lock().remove(&tag);
  }

  fn lock(&self) -> MutexGuard<'_, BTreeSet<SyncTag>> {
    self.0.lock().unwrap_or_else(|e| e.into_inner())
  }
}

struct TagEntry {
  kind: TriggerKind,
  state: TagState,
  /// Firings that have started and not yet finished
  in_flight: usize,
  /// Accepted by the host's trigger mechanism, not just known locally
  host_registered: bool,
  last_periodic: Option<Instant>,
  jobs: Vec<Arc<dyn SyncJob>>,
}

pub struct TriggerScheduler {
  tags: Mutex<BTreeMap<SyncTag, TagEntry>>,
  intents: SyncIntents,
  capabilities: HostCapabilities,
  status: Arc<SyncStatusController>,
}

impl TriggerScheduler {
  pub fn new(capabilities: HostCapabilities, status: Arc<SyncStatusController>) -> Self {
    if !capabilities.background_sync && !capabilities.periodic_sync {
      info!("Host offers no sync triggers, running manual-only");
    }
    Self {
      tags: Mutex::new(BTreeMap::new()),
      intents: SyncIntents::default(),
      capabilities,
      status,
    }
  }

  /// Register a tag. Returns whether the host accepted it for automatic
  /// firing; a refused tag still fires manually.
  pub fn register(&self, tag: SyncTag, kind: TriggerKind) -> bool {
    let host_registered = match kind {
      TriggerKind::OneShot => self.capabilities.background_sync,
      TriggerKind::Periodic { .. } => self.capabilities.periodic_sync,
    };
    if !host_registered {
      warn!(%tag, "Trigger unsupported by host, tag will only fire manually");
    }

    let mut tags = self.lock_tags();
    let entry = tags.entry(tag).or_insert_with(|| TagEntry {
      kind,
      state: TagState::Unregistered,
      in_flight: 0,
      host_registered,
      last_periodic: None,
      jobs: Vec::new(),
    });
    entry.kind = kind;
    entry.host_registered = host_registered;
    if entry.state == TagState::Unregistered {
      entry.state = TagState::Registered;
    }
    debug!(%tag, ?kind, host_registered, "Registered sync tag");
    host_registered
  }

  /// Attach a job to a registered tag.
  pub fn bind(&self, tag: SyncTag, job: Arc<dyn SyncJob>) -> Result<()> {
    let mut tags = self.lock_tags();
    let entry = tags
      .get_mut(&tag)
      .ok_or_else(|| eyre!("Cannot bind {} to unregistered tag {}", job.label(), tag))?;
    entry.jobs.push(job);
    Ok(())
  }

  pub fn state(&self, tag: SyncTag) -> TagState {
    self
      .lock_tags()
      .get(&tag)
      .map(|e| e.state)
      .unwrap_or(TagState::Unregistered)
  }

  /// Handle for queues to request their tag with.
  pub fn intents(&self) -> SyncIntents {
    self.intents.clone()
  }

  /// Requested tags that `source` may fire.
  pub fn requested(&self, source: TriggerSource) -> Vec<SyncTag> {
    let pending = self.intents.pending();
    let tags = self.lock_tags();
    pending
      .into_iter()
      .filter(|tag| tags.get(tag).is_some_and(|entry| Self::accepts(entry, source)))
      .collect()
  }

  pub fn is_manual_only(&self) -> bool {
    !self.capabilities.background_sync && !self.capabilities.periodic_sync
  }

  /// Registered tags that `source` may fire.
  pub fn tags_for(&self, source: TriggerSource) -> Vec<SyncTag> {
    self
      .lock_tags()
      .iter()
      .filter(|(_, entry)| Self::accepts(entry, source))
      .map(|(tag, _)| *tag)
      .collect()
  }

  fn accepts(entry: &TagEntry, source: TriggerSource) -> bool {
    if entry.state == TagState::Unregistered {
      return false;
    }
    match (source, entry.kind) {
      (TriggerSource::Manual, _) => true,
      (TriggerSource::Connectivity, TriggerKind::OneShot) => entry.host_registered,
      (TriggerSource::Periodic, TriggerKind::Periodic { .. }) => entry.host_registered,
      _ => false,
    }
  }

  /// Fire `tag` and run its jobs to completion.
  ///
  /// Returns `None` when the tag is unknown, the source may not fire it, or a
  /// periodic tick arrives sooner than the tag's minimum interval.
  ///
  /// Firing a one-shot tag satisfies its pending request; a firing that
  /// leaves work behind requests the tag again.
  pub async fn fire(&self, tag: SyncTag, source: TriggerSource) -> Option<TagOutcome> {
    let (jobs, kind) = {
      let mut tags = self.lock_tags();
      let entry = tags.get_mut(&tag)?;
      if !Self::accepts(entry, source) {
        debug!(%tag, ?source, "Trigger not accepted");
        return None;
      }
      if let (TriggerSource::Periodic, TriggerKind::Periodic { min_interval }) = (source, entry.kind) {
        let now = Instant::now();
        if let Some(last) = entry.last_periodic {
          if now.duration_since(last) < min_interval {
            debug!(%tag, "Periodic tick inside minimum interval, skipping");
            return None;
          }
        }
        entry.last_periodic = Some(now);
      }
      entry.state = TagState::Firing;
      entry.in_flight += 1;
      (entry.jobs.clone(), entry.kind)
    };
    if kind == TriggerKind::OneShot {
      self.intents.clear(tag);
    }

    info!(%tag, ?source, jobs = jobs.len(), "Firing sync tag");
    self.status.begin();

    let results = join_all(jobs.iter().map(|job| job.run())).await;
    let mut outcome = TagOutcome {
      tag,
      source,
      reports: Vec::new(),
      errors: Vec::new(),
    };
    for (job, result) in jobs.iter().zip(results) {
      match result {
        Ok(report) => outcome.reports.push(report),
        Err(e) => {
          warn!(%tag, job = %job.label(), "Sync job failed: {}", e);
          outcome.errors.push(format!("{}: {}", job.label(), e));
        }
      }
    }

    self.status.finish(outcome.is_success());
    if kind == TriggerKind::OneShot && !outcome.is_success() {
      self.intents.request(tag);
    }
    if let Some(entry) = self.lock_tags().get_mut(&tag) {
      entry.in_flight = entry.in_flight.saturating_sub(1);
      if entry.in_flight == 0 {
        entry.state = TagState::Idle;
      }
    }
    Some(outcome)
  }

  fn lock_tags(&self) -> MutexGuard<'_, BTreeMap<SyncTag, TagEntry>> {
    self.tags.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::db::Database;
  use crate::queue::Domain;
  use crate::status::SyncStatus;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::sync::Semaphore;

  struct CountingJob {
    runs: AtomicUsize,
    fail: bool,
  }

  impl CountingJob {
    fn new(fail: bool) -> Arc<Self> {
      Arc::new(Self {
        runs: AtomicUsize::new(0),
        fail,
      })
    }
  }

  impl SyncJob for CountingJob {
    fn label(&self) -> String {
      "counting".to_string()
    }

    fn run(&self) -> BoxFuture<'_, Result<JobReport>> {
      Box::pin(async move {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
          Err(eyre!("store unavailable"))
        } else {
          Ok(JobReport::Replay(ReplayReport {
            domain: Some(Domain::Gesture),
            ..ReplayReport::default()
          }))
        }
      })
    }
  }

  /// Blocks each run until the test hands out a permit.
  struct GatedJob {
    permits: Semaphore,
  }

  impl SyncJob for GatedJob {
    fn label(&self) -> String {
      "gated".to_string()
    }

    fn run(&self) -> BoxFuture<'_, Result<JobReport>> {
      Box::pin(async move {
        self
          .permits
          .acquire()
          .await
          .map_err(|e| eyre!("{}", e))?
          .forget();
        Ok(JobReport::Content { refreshed: false })
      })
    }
  }

  fn scheduler(capabilities: HostCapabilities) -> (TriggerScheduler, Arc<SyncStatusController>) {
    let status = SyncStatusController::new(
      Arc::new(Database::open_in_memory().unwrap()),
      Arc::new(ManualClock::new()),
      Duration::from_secs(3),
    );
    (TriggerScheduler::new(capabilities, status.clone()), status)
  }

  #[test]
  fn test_tag_names() {
    assert_eq!("gesture-sync".parse::<SyncTag>().unwrap(), SyncTag::GestureSync);
    assert_eq!(SyncTag::ContentSync.to_string(), "content-sync");
    assert!("nightly".parse::<SyncTag>().is_err());
  }

  #[tokio::test]
  async fn test_lifecycle_states() {
    let (scheduler, _) = scheduler(HostCapabilities::default());
    assert_eq!(scheduler.state(SyncTag::GestureSync), TagState::Unregistered);

    scheduler.register(SyncTag::GestureSync, TriggerKind::OneShot);
    assert_eq!(scheduler.state(SyncTag::GestureSync), TagState::Registered);

    let job = CountingJob::new(false);
    scheduler.bind(SyncTag::GestureSync, job.clone()).unwrap();
    let outcome = scheduler
      .fire(SyncTag::GestureSync, TriggerSource::Connectivity)
      .await
      .unwrap();

    assert!(outcome.is_success());
    assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.state(SyncTag::GestureSync), TagState::Idle);
  }

  #[tokio::test]
  async fn test_fire_runs_every_bound_job() {
    let (scheduler, _) = scheduler(HostCapabilities::default());
    scheduler.register(SyncTag::OfflineQueue, TriggerKind::OneShot);
    let a = CountingJob::new(false);
    let b = CountingJob::new(false);
    scheduler.bind(SyncTag::OfflineQueue, a.clone()).unwrap();
    scheduler.bind(SyncTag::OfflineQueue, b.clone()).unwrap();

    let outcome = scheduler
      .fire(SyncTag::OfflineQueue, TriggerSource::Manual)
      .await
      .unwrap();
    assert_eq!(outcome.reports.len(), 2);
    assert_eq!(outcome.replays().count(), 2);
    assert_eq!(a.runs.load(Ordering::SeqCst), 1);
    assert_eq!(b.runs.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_unregistered_tag_does_not_fire() {
    let (scheduler, _) = scheduler(HostCapabilities::default());
    assert!(scheduler
      .fire(SyncTag::GestureSync, TriggerSource::Manual)
      .await
      .is_none());
    assert!(scheduler
      .bind(SyncTag::GestureSync, CountingJob::new(false))
      .is_err());
  }

  #[tokio::test]
  async fn test_missing_capabilities_degrade_to_manual() {
    let (scheduler, _) = scheduler(HostCapabilities {
      background_sync: false,
      periodic_sync: false,
    });
    assert!(scheduler.is_manual_only());
    assert!(!scheduler.register(SyncTag::GamificationSync, TriggerKind::OneShot));
    let job = CountingJob::new(false);
    scheduler.bind(SyncTag::GamificationSync, job.clone()).unwrap();

    assert!(scheduler.tags_for(TriggerSource::Connectivity).is_empty());
    assert!(scheduler
      .fire(SyncTag::GamificationSync, TriggerSource::Connectivity)
      .await
      .is_none());
    assert!(scheduler
      .fire(SyncTag::GamificationSync, TriggerSource::Manual)
      .await
      .is_some());
    assert_eq!(job.runs.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_sources_match_trigger_kind() {
    let (scheduler, _) = scheduler(HostCapabilities::default());
    scheduler.register(SyncTag::OfflineQueue, TriggerKind::OneShot);
    scheduler.register(
      SyncTag::ContentSync,
      TriggerKind::Periodic {
        min_interval: Duration::from_secs(60),
      },
    );

    assert_eq!(
      scheduler.tags_for(TriggerSource::Connectivity),
      vec![SyncTag::OfflineQueue]
    );
    assert_eq!(
      scheduler.tags_for(TriggerSource::Periodic),
      vec![SyncTag::ContentSync]
    );
    assert_eq!(scheduler.tags_for(TriggerSource::Manual).len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_periodic_respects_minimum_interval() {
    let (scheduler, _) = scheduler(HostCapabilities::default());
    scheduler.register(
      SyncTag::ContentSync,
      TriggerKind::Periodic {
        min_interval: Duration::from_secs(60),
      },
    );
    let job = CountingJob::new(false);
    scheduler.bind(SyncTag::ContentSync, job.clone()).unwrap();

    assert!(scheduler.fire(SyncTag::ContentSync, TriggerSource::Periodic).await.is_some());
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(scheduler.fire(SyncTag::ContentSync, TriggerSource::Periodic).await.is_none());
    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(scheduler.fire(SyncTag::ContentSync, TriggerSource::Periodic).await.is_some());
    assert_eq!(job.runs.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_job_sets_error_status() {
    let (scheduler, status) = scheduler(HostCapabilities::default());
    scheduler.register(SyncTag::GestureSync, TriggerKind::OneShot);
    scheduler.bind(SyncTag::GestureSync, CountingJob::new(true)).unwrap();
    scheduler.bind(SyncTag::GestureSync, CountingJob::new(false)).unwrap();

    let outcome = scheduler
      .fire(SyncTag::GestureSync, TriggerSource::Manual)
      .await
      .unwrap();
    assert!(!outcome.is_success());
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.reports.len(), 1);

    let session = status.snapshot();
    assert_eq!(session.status, SyncStatus::Error);
    assert!(session.last_sync_time.is_none());
  }

  #[tokio::test]
  async fn test_requests_are_cleared_by_firing_and_renewed_by_failure() {
    let (scheduler, _) = scheduler(HostCapabilities::default());
    scheduler.register(SyncTag::OfflineQueue, TriggerKind::OneShot);
    scheduler.register(SyncTag::GestureSync, TriggerKind::OneShot);
    scheduler.register(
      SyncTag::ContentSync,
      TriggerKind::Periodic {
        min_interval: Duration::from_secs(60),
      },
    );
    scheduler.bind(SyncTag::OfflineQueue, CountingJob::new(false)).unwrap();
    scheduler.bind(SyncTag::GestureSync, CountingJob::new(true)).unwrap();

    let intents = scheduler.intents();
    intents.request(SyncTag::OfflineQueue);
    intents.request(SyncTag::GestureSync);
    intents.request(SyncTag::ContentSync);
    assert_eq!(
      scheduler.requested(TriggerSource::Connectivity),
      vec![SyncTag::OfflineQueue, SyncTag::GestureSync]
    );

    scheduler
      .fire(SyncTag::OfflineQueue, TriggerSource::Connectivity)
      .await
      .unwrap();
    scheduler
      .fire(SyncTag::GestureSync, TriggerSource::Connectivity)
      .await
      .unwrap();
    assert_eq!(
      scheduler.requested(TriggerSource::Connectivity),
      vec![SyncTag::GestureSync]
    );
  }

  #[tokio::test]
  async fn test_manual_only_host_never_fires_requests_automatically() {
    let (scheduler, _) = scheduler(HostCapabilities {
      background_sync: false,
      periodic_sync: false,
    });
    scheduler.register(SyncTag::GestureSync, TriggerKind::OneShot);
    scheduler.intents().request(SyncTag::GestureSync);
    assert!(scheduler.requested(TriggerSource::Connectivity).is_empty());
    assert_eq!(
      scheduler.requested(TriggerSource::Manual),
      vec![SyncTag::GestureSync]
    );
  }

  #[tokio::test]
  async fn test_overlapping_firings_stay_firing_until_the_last_finishes() {
    let (scheduler, _) = scheduler(HostCapabilities::default());
    let scheduler = Arc::new(scheduler);
    scheduler.register(SyncTag::ContentSync, TriggerKind::OneShot);
    let job = Arc::new(GatedJob {
      permits: Semaphore::new(0),
    });
    scheduler.bind(SyncTag::ContentSync, job.clone()).unwrap();

    let spawn_fire = |scheduler: Arc<TriggerScheduler>| {
      tokio::spawn(async move { scheduler.fire(SyncTag::ContentSync, TriggerSource::Manual).await })
    };
    let first = spawn_fire(scheduler.clone());
    let second = spawn_fire(scheduler.clone());
    tokio::task::yield_now().await;
    assert_eq!(scheduler.state(SyncTag::ContentSync), TagState::Firing);

    job.permits.add_permits(1);
    while !first.is_finished() && !second.is_finished() {
      tokio::task::yield_now().await;
    }
    assert_eq!(scheduler.state(SyncTag::ContentSync), TagState::Firing);

    job.permits.add_permits(1);
    assert!(first.await.unwrap().is_some());
    assert!(second.await.unwrap().is_some());
    assert_eq!(scheduler.state(SyncTag::ContentSync), TagState::Idle);
  }
}
