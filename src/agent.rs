//! The background agent: owns every store and queue handle and reacts to
//! foreground messages and host events.

use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, BoxFuture};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  CachePolicyTable, CacheRouter, CacheSource, CacheStorage, NoopStorage, RouteOutcome,
  SqliteStorage,
};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::Database;
use crate::event::{ConnectivityMonitor, HostEvent};
use crate::messages::AgentMessage;
use crate::net::{Request, Transport};
use crate::queue::{Domain, QueueSet, QueueStorage, QueuedMutation};
use crate::retry::{FailedSyncLog, RetryReport};
use crate::scheduler::{
  HostCapabilities, JobReport, SyncJob, SyncTag, TagOutcome, TriggerKind, TriggerScheduler,
  TriggerSource,
};
use crate::status::SyncStatusController;

const CONTENT_PATH: &str = "/api/sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  Installing,
  /// Installed, waiting for the previous agent to let go
  Waiting,
  Active,
}

/// Refreshes shared content through the router when `content-sync` fires.
struct ContentRefresh {
  router: Arc<CacheRouter>,
  url: Url,
}

impl SyncJob for ContentRefresh {
  fn label(&self) -> String {
    "content".to_string()
  }

  fn run(&self) -> BoxFuture<'_, Result<JobReport>> {
    Box::pin(async move {
      let outcome = self
        .router
        .route(Request::get(self.url.clone()))
        .await
        .map_err(|e| eyre!("Content refresh failed: {}", e))?;
      let refreshed = match outcome {
        RouteOutcome::Served(result) => {
          result.source == CacheSource::Network && result.data.is_success()
        }
        RouteOutcome::Queued(_) => false,
      };
      debug!(refreshed, "Content refresh finished");
      Ok(JobReport::Content { refreshed })
    })
  }
}

pub struct BackgroundAgent {
  router: Arc<CacheRouter>,
  queues: Arc<QueueSet>,
  scheduler: TriggerScheduler,
  status: Arc<SyncStatusController>,
  failed: Arc<FailedSyncLog>,
  transport: Arc<dyn Transport>,
  base_url: Url,
  precache: Vec<Url>,
  content_url: Url,
  health_url: Url,
  probe_interval: Duration,
  periodic_interval: Option<Duration>,
  lifecycle: Mutex<Lifecycle>,
  online: AtomicBool,
  outbound: broadcast::Sender<AgentMessage>,
}

impl BackgroundAgent {
  /// Build every component once and wire the queues to their trigger tags.
  pub fn new(
    config: &Config,
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let status = SyncStatusController::new(
      db.clone(),
      clock.clone(),
      Duration::from_secs(config.sync.status_display_secs),
    );

    let periodic_interval = Duration::from_secs(config.sync.periodic_interval_secs);
    let scheduler = TriggerScheduler::new(
      HostCapabilities {
        background_sync: config.sync.background_sync,
        periodic_sync: config.sync.periodic_sync,
      },
      status.clone(),
    );

    let queues = Arc::new(QueueSet::new(
      &config.base_url,
      QueueStorage::new(db.clone()),
      transport.clone(),
      status.clone(),
      clock.clone(),
      scheduler.intents(),
    )?);
    match queues.total_pending() {
      Ok(pending) => status.set_pending(pending),
      Err(e) => warn!("Failed to count queued mutations: {}", e),
    }
    // Entries left by an earlier run go out on the first reachable probe
    for queue in queues.iter() {
      match queue.len() {
        Ok(0) => {}
        Ok(_) => scheduler.intents().request(queue.domain().tag()),
        Err(e) => warn!(store = queue.store_name(), "Failed to count queued mutations: {}", e),
      }
    }

    let failed = Arc::new(FailedSyncLog::new(
      db.clone(),
      transport.clone(),
      clock.clone(),
      chrono::Duration::days(config.retry.max_age_days),
    ));

    let storage: Arc<dyn CacheStorage> = if config.cache.enabled {
      Arc::new(SqliteStorage::new(db))
    } else {
      Arc::new(NoopStorage)
    };
    let router = Arc::new(CacheRouter::new(
      CachePolicyTable::defaults().with_limits(&config.cache.limits),
      storage,
      transport.clone(),
      queues.clone(),
      failed.clone(),
      clock,
    ));

    for tag in [SyncTag::OfflineQueue, SyncTag::GamificationSync, SyncTag::GestureSync] {
      scheduler.register(tag, TriggerKind::OneShot);
    }
    scheduler.register(
      SyncTag::ContentSync,
      TriggerKind::Periodic {
        min_interval: periodic_interval,
      },
    );
    for queue in queues.iter() {
      scheduler.bind(queue.domain().tag(), queue.clone())?;
    }
    let content_url = config.resolve(CONTENT_PATH)?;
    scheduler.bind(
      SyncTag::ContentSync,
      Arc::new(ContentRefresh {
        router: router.clone(),
        url: content_url.clone(),
      }),
    )?;

    let precache = config
      .cache
      .precache
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    let (outbound, _) = broadcast::channel(64);

    Ok(Self {
      router,
      queues,
      scheduler,
      status,
      failed,
      transport,
      base_url: config.base_url.clone(),
      precache,
      content_url,
      health_url: config.resolve("/api/health")?,
      probe_interval: Duration::from_secs(config.sync.probe_interval_secs),
      periodic_interval: config.sync.periodic_sync.then_some(periodic_interval),
      lifecycle: Mutex::new(Lifecycle::Installing),
      online: AtomicBool::new(true),
      outbound,
    })
  }

  pub fn router(&self) -> &Arc<CacheRouter> {
    &self.router
  }

  pub fn queues(&self) -> &QueueSet {
    &self.queues
  }

  pub fn status(&self) -> &Arc<SyncStatusController> {
    &self.status
  }

  pub fn failed(&self) -> &FailedSyncLog {
    &self.failed
  }

  pub fn scheduler(&self) -> &TriggerScheduler {
    &self.scheduler
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  pub fn lifecycle(&self) -> Lifecycle {
    *self.lock_lifecycle()
  }

  /// Messages for the foreground.
  pub fn subscribe(&self) -> broadcast::Receiver<AgentMessage> {
    self.outbound.subscribe()
  }

  /// Fetch and store the app shell. Entries that fail to load are skipped.
  pub async fn install(&self) -> usize {
    *self.lock_lifecycle() = Lifecycle::Installing;
    let mut cached = 0;
    for url in &self.precache {
      match self.router.route(Request::get(url.clone())).await {
        Ok(RouteOutcome::Served(result)) if result.data.is_success() => cached += 1,
        Ok(_) => warn!(%url, "Precache returned no usable response"),
        Err(e) => warn!(%url, "Precache failed: {}", e),
      }
    }
    info!(cached, total = self.precache.len(), "Installed");
    *self.lock_lifecycle() = Lifecycle::Waiting;
    cached
  }

  /// Take over: drop cache stores no policy uses and prune the failed log.
  pub fn activate(&self) -> Result<()> {
    let pruned = self.router.prune_obsolete_stores()?;
    let expired = self.failed.cleanup()?;
    *self.lock_lifecycle() = Lifecycle::Active;
    info!(pruned = pruned.len(), expired, "Activated");
    Ok(())
  }

  pub async fn handle_message(&self, message: AgentMessage) -> Result<()> {
    debug!(?message, "Inbound message");
    match message {
      AgentMessage::SkipWaiting => {
        if self.lifecycle() == Lifecycle::Waiting {
          self.activate()?;
        }
      }
      AgentMessage::StoreGamificationData(payload) => {
        self.store(Domain::Gamification, &payload).await?;
      }
      AgentMessage::StoreGestureData(payload) => {
        self.store(Domain::Gesture, &payload).await?;
      }
      AgentMessage::SyncRequested { tag } => {
        self.trigger(tag, TriggerSource::Manual).await;
      }
      other => warn!(?other, "Ignoring message meant for the foreground"),
    }
    Ok(())
  }

  /// Queue a payload, then try to deliver it right away if the network is up.
  async fn store(&self, domain: Domain, payload: &serde_json::Value) -> Result<QueuedMutation> {
    let mutation = self.queues.enqueue(domain, payload)?;
    if self.online.load(Ordering::SeqCst) {
      self.trigger(domain.tag(), TriggerSource::Connectivity).await;
    }
    Ok(mutation)
  }

  pub async fn handle_host_event(&self, event: HostEvent) -> Vec<TagOutcome> {
    let (source, tags) = match event {
      HostEvent::ConnectivityLost => {
        self.online.store(false, Ordering::SeqCst);
        return Vec::new();
      }
      HostEvent::ConnectivityRestored => {
        self.online.store(true, Ordering::SeqCst);
        let source = TriggerSource::Connectivity;
        (source, self.scheduler.tags_for(source))
      }
      // Only tags with requested work
      HostEvent::Reachable => {
        self.online.store(true, Ordering::SeqCst);
        let source = TriggerSource::Connectivity;
        (source, self.scheduler.requested(source))
      }
      HostEvent::PeriodicTick => {
        let source = TriggerSource::Periodic;
        (source, self.scheduler.tags_for(source))
      }
    };

    join_all(tags.into_iter().map(|tag| self.trigger(tag, source)))
      .await
      .into_iter()
      .flatten()
      .collect()
  }

  /// Fire every registered tag by hand.
  pub async fn sync_all(&self) -> Vec<TagOutcome> {
    let tags = self.scheduler.tags_for(TriggerSource::Manual);
    join_all(tags.into_iter().map(|tag| self.trigger(tag, TriggerSource::Manual)))
      .await
      .into_iter()
      .flatten()
      .collect()
  }

  /// Fire one tag and tell the foreground what was delivered.
  pub async fn trigger(&self, tag: SyncTag, source: TriggerSource) -> Option<TagOutcome> {
    let outcome = self.scheduler.fire(tag, source).await?;

    for report in &outcome.reports {
      let message = match report {
        JobReport::Replay(replay) if !replay.succeeded.is_empty() => match replay.domain {
          Some(Domain::Gamification) => AgentMessage::GamificationSynced {
            count: replay.succeeded.len(),
          },
          Some(Domain::Gesture) => AgentMessage::GesturesSynced {
            count: replay.succeeded.len(),
          },
          _ => continue,
        },
        JobReport::Content { refreshed: true } => AgentMessage::ContentUpdated {
          url: self.content_url.to_string(),
        },
        _ => continue,
      };
      self.broadcast(message);
    }
    Some(outcome)
  }

  pub async fn retry_failed(&self) -> Result<RetryReport> {
    self.failed.retry().await
  }

  fn broadcast(&self, message: AgentMessage) {
    // No subscribers is fine
    let _ = self.outbound.send(message);
  }

  /// Run until `inbound` closes: react to host events and messages, and
  /// mirror status changes to subscribers.
  pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<AgentMessage>) -> Result<()> {
    let mut monitor = ConnectivityMonitor::spawn(
      self.transport.clone(),
      self.health_url.clone(),
      self.probe_interval,
      self.periodic_interval,
    );
    let mut status_rx = self.status.subscribe();
    if self.scheduler.is_manual_only() {
      info!("Automatic sync unavailable, waiting for SYNC_REQUESTED");
    }

    loop {
      tokio::select! {
        event = monitor.next() => {
          let Some(event) = event else {
            return Err(eyre!("Connectivity monitor stopped"));
          };
          let agent = Arc::clone(&self);
          tokio::spawn(async move {
            agent.handle_host_event(event).await;
          });
        }
        message = inbound.recv() => {
          let Some(message) = message else {
            info!("Inbound channel closed, stopping agent");
            return Ok(());
          };
          let agent = Arc::clone(&self);
          tokio::spawn(async move {
            if let Err(e) = agent.handle_message(message).await {
              warn!("Failed to handle message: {}", e);
            }
          });
        }
        changed = status_rx.changed() => {
          if changed.is_err() {
            return Ok(());
          }
          let session = status_rx.borrow_and_update().clone();
          self.broadcast(AgentMessage::SyncStatus(session));
        }
      }
    }
  }

  fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
    self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
  }
}
