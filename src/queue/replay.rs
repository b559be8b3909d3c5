//! The queue type shared by every domain, and the set of four instances.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::domain::Domain;
use super::storage::{LoadedMutation, QueueStorage, QueuedMutation};
use crate::clock::Clock;
use crate::net::{Request, Transport};
use crate::scheduler::{JobReport, SyncIntents, SyncJob};
use crate::status::SyncStatusController;

/// Outcome of one pass over a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
  pub domain: Option<Domain>,
  /// Delivered and removed
  pub succeeded: Vec<String>,
  /// Still queued for the next trigger
  pub remaining: Vec<String>,
  /// Unreadable entries dropped without a delivery attempt
  pub discarded: Vec<String>,
}

impl ReplayReport {
  fn new(domain: Domain) -> Self {
    Self {
      domain: Some(domain),
      ..Self::default()
    }
  }

  pub fn is_clean(&self) -> bool {
    self.remaining.is_empty()
  }
}

/// Durable FIFO of pending writes for one domain.
pub struct MutationQueue {
  domain: Domain,
  endpoint: Option<Url>,
  storage: QueueStorage,
  transport: Arc<dyn Transport>,
  status: Arc<SyncStatusController>,
  clock: Arc<dyn Clock>,
  intents: SyncIntents,
  /// Serialises replays of this queue; other queues run independently
  replay_lock: tokio::sync::Mutex<()>,
}

impl MutationQueue {
  pub fn new(
    domain: Domain,
    base_url: &Url,
    storage: QueueStorage,
    transport: Arc<dyn Transport>,
    status: Arc<SyncStatusController>,
    clock: Arc<dyn Clock>,
    intents: SyncIntents,
  ) -> Result<Self> {
    let endpoint = domain
      .endpoint()
      .map(|path| {
        base_url
          .join(path)
          .map_err(|e| eyre!("Invalid endpoint for {}: {}", domain, e))
      })
      .transpose()?;

    Ok(Self {
      domain,
      endpoint,
      storage,
      transport,
      status,
      clock,
      intents,
      replay_lock: tokio::sync::Mutex::new(()),
    })
  }

  pub fn domain(&self) -> Domain {
    self.domain
  }

  pub fn store_name(&self) -> &'static str {
    self.domain.store_name()
  }

  /// Queue a payload for the domain's fixed endpoint.
  pub fn enqueue(&self, payload: &serde_json::Value) -> Result<QueuedMutation> {
    let endpoint = self
      .endpoint
      .clone()
      .ok_or_else(|| eyre!("The {} queue only accepts captured requests", self.domain))?;
    let request = Request::post_json(endpoint, payload)?;
    self.enqueue_request(&request)
  }

  /// Queue a request that could not be delivered and ask for the domain's
  /// tag to fire once the host is reachable.
  pub fn enqueue_request(&self, request: &Request) -> Result<QueuedMutation> {
    let mutation = QueuedMutation::from_request(self.domain, request, self.clock.now());
    self.storage.push(&mutation)?;
    self.status.record_enqueued();
    self.intents.request(self.domain.tag());
    info!(
      store = self.store_name(),
      id = %mutation.id,
      method = %mutation.method,
      url = %mutation.url,
      "Queued mutation for later delivery"
    );
    Ok(mutation)
  }

  /// Re-send every entry in insertion order.
  ///
  /// A 2xx removes the entry; anything else leaves it for the next trigger
  /// and moves on. Only failing to read or update the queue itself is an
  /// error, and it ends the pass.
  pub async fn replay(&self) -> Result<ReplayReport> {
    let _guard = self.replay_lock.lock().await;
    let store = self.store_name();
    let entries = self
      .storage
      .load(store)
      .map_err(|e| eyre!("Queue {} unavailable: {}", store, e))?;

    let mut report = ReplayReport::new(self.domain);
    for entry in entries {
      let mutation = match entry {
        LoadedMutation::Valid(mutation) => mutation,
        LoadedMutation::Malformed { id, reason } => {
          warn!(store, %id, "Dropping unreadable queue entry: {}", reason);
          if self.storage.remove(store, &id)? {
            self.status.record_delivered(1);
          }
          report.discarded.push(id);
          continue;
        }
      };

      match self.transport.send(mutation.to_request()).await {
        Ok(response) if response.is_success() => {
          self.storage.remove(store, &mutation.id)?;
          self.status.record_delivered(1);
          report.succeeded.push(mutation.id);
        }
        Ok(response) => {
          debug!(store, id = %mutation.id, status = response.status, "Replay rejected, keeping entry");
          report.remaining.push(mutation.id);
        }
        Err(e) => {
          debug!(store, id = %mutation.id, "Replay failed, keeping entry: {}", e);
          report.remaining.push(mutation.id);
        }
      }
    }

    info!(
      store,
      succeeded = report.succeeded.len(),
      remaining = report.remaining.len(),
      discarded = report.discarded.len(),
      "Replay finished"
    );
    Ok(report)
  }

  /// Drop every pending entry without sending it.
  pub fn purge(&self) -> Result<usize> {
    let removed = self.storage.purge(self.store_name())?;
    self.status.record_delivered(removed);
    info!(store = self.store_name(), removed, "Purged queue");
    Ok(removed)
  }

  pub fn len(&self) -> Result<usize> {
    self.storage.count(self.store_name())
  }

  /// Readable entries, oldest first.
  pub fn pending(&self) -> Result<Vec<QueuedMutation>> {
    Ok(
      self
        .storage
        .load(self.store_name())?
        .into_iter()
        .filter_map(|entry| match entry {
          LoadedMutation::Valid(m) => Some(m),
          LoadedMutation::Malformed { .. } => None,
        })
        .collect(),
    )
  }
}

impl SyncJob for MutationQueue {
  fn label(&self) -> String {
    self.store_name().to_string()
  }

  fn run(&self) -> BoxFuture<'_, Result<JobReport>> {
    Box::pin(async move { self.replay().await.map(JobReport::Replay) })
  }
}

/// The four domain queues, built once and shared.
pub struct QueueSet {
  generic: Arc<MutationQueue>,
  gamification: Arc<MutationQueue>,
  gesture: Arc<MutationQueue>,
  social_share: Arc<MutationQueue>,
}

impl QueueSet {
  pub fn new(
    base_url: &Url,
    storage: QueueStorage,
    transport: Arc<dyn Transport>,
    status: Arc<SyncStatusController>,
    clock: Arc<dyn Clock>,
    intents: SyncIntents,
  ) -> Result<Self> {
    let build = |domain: Domain| -> Result<Arc<MutationQueue>> {
      Ok(Arc::new(MutationQueue::new(
        domain,
        base_url,
        storage.clone(),
        Arc::clone(&transport),
        Arc::clone(&status),
        Arc::clone(&clock),
        intents.clone(),
      )?))
    };

    Ok(Self {
      generic: build(Domain::Generic)?,
      gamification: build(Domain::Gamification)?,
      gesture: build(Domain::Gesture)?,
      social_share: build(Domain::SocialShare)?,
    })
  }

  pub fn get(&self, domain: Domain) -> &Arc<MutationQueue> {
    match domain {
      Domain::Generic => &self.generic,
      Domain::Gamification => &self.gamification,
      Domain::Gesture => &self.gesture,
      Domain::SocialShare => &self.social_share,
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<MutationQueue>> {
    Domain::ALL.into_iter().map(move |d| self.get(d))
  }

  pub fn enqueue(&self, domain: Domain, payload: &serde_json::Value) -> Result<QueuedMutation> {
    self.get(domain).enqueue(payload)
  }

  pub async fn replay(&self, domain: Domain) -> Result<ReplayReport> {
    self.get(domain).replay().await
  }

  /// Actual number of queued entries across all domains.
  pub fn total_pending(&self) -> Result<usize> {
    self.iter().map(|q| q.len()).sum()
  }
}
