//! Routes every outgoing request through the caching strategy its policy names.

use color_eyre::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::policy::{CachePolicy, CachePolicyTable, FailureAction, Strategy};
use super::storage::{CacheEntry, CacheStorage};
use super::store::NamedCacheStore;
use super::traits::CacheResult;
use crate::clock::Clock;
use crate::error::FetchError;
use crate::net::{Request, Response, Transport};
use crate::queue::{Domain, QueueSet, QueuedMutation};
use crate::retry::FailedSyncLog;

/// What the caller gets back.
#[derive(Debug)]
pub enum RouteOutcome {
  Served(CacheResult),
  /// The write could not be sent and is stored for later delivery
  Queued(QueuedMutation),
}

impl RouteOutcome {
  pub fn served(self) -> Option<CacheResult> {
    match self {
      RouteOutcome::Served(result) => Some(result),
      RouteOutcome::Queued(_) => None,
    }
  }
}

pub struct CacheRouter {
  table: CachePolicyTable,
  storage: Arc<dyn CacheStorage>,
  transport: Arc<dyn Transport>,
  queues: Arc<QueueSet>,
  failed: Arc<FailedSyncLog>,
  clock: Arc<dyn Clock>,
}

impl CacheRouter {
  pub fn new(
    table: CachePolicyTable,
    storage: Arc<dyn CacheStorage>,
    transport: Arc<dyn Transport>,
    queues: Arc<QueueSet>,
    failed: Arc<FailedSyncLog>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      table,
      storage,
      transport,
      queues,
      failed,
      clock,
    }
  }

  pub fn table(&self) -> &CachePolicyTable {
    &self.table
  }

  /// Serve `request` according to the first policy that matches it.
  pub async fn route(&self, request: Request) -> Result<RouteOutcome, FetchError> {
    let policy = self.table.select(&request);
    debug!(policy = policy.name, method = %request.method, url = %request.url, "Routing request");

    let store = NamedCacheStore::for_policy(policy, &self.storage, &self.clock);
    let outcome = match (policy.strategy, store) {
      (Strategy::CacheFirst, Some(store)) => self.cache_first(policy, &store, request).await?,
      (Strategy::StaleWhileRevalidate, Some(store)) => {
        self.stale_while_revalidate(policy, &store, request).await?
      }
      (Strategy::NetworkFirst, Some(store)) => self.network_first(policy, &store, request).await?,
      _ => self.network_only(policy, request).await?,
    };

    if let RouteOutcome::Served(result) = &outcome {
      debug!(policy = policy.name, source = ?result.source, degraded = result.degraded, "Served");
    }
    Ok(outcome)
  }

  async fn cache_first(
    &self,
    policy: &CachePolicy,
    store: &NamedCacheStore,
    request: Request,
  ) -> Result<RouteOutcome, FetchError> {
    let (cached, mut degraded) = read_store(store, |s, key| s.get(key), &request);
    if let Some(entry) = cached {
      return Ok(RouteOutcome::Served(CacheResult::from_cache(
        entry.to_response(),
        entry.stored_at,
        false,
      )));
    }

    let response = self.transport.send(request.clone()).await?;
    if !degraded && policy.is_cacheable(response.status) {
      degraded = !write_store(store, &request, &response);
    }
    Ok(RouteOutcome::Served(
      CacheResult::from_network(response).degraded(degraded),
    ))
  }

  async fn stale_while_revalidate(
    &self,
    policy: &CachePolicy,
    store: &NamedCacheStore,
    request: Request,
  ) -> Result<RouteOutcome, FetchError> {
    let (cached, mut degraded) = read_store(store, |s, key| s.get_any(key), &request);
    if let Some(entry) = cached {
      let stale = store.is_expired(&entry);
      let revalidation =
        self.spawn_revalidation(store.clone(), policy.cacheable_statuses.clone(), request);
      return Ok(RouteOutcome::Served(
        CacheResult::from_cache(entry.to_response(), entry.stored_at, stale)
          .with_revalidation(revalidation),
      ));
    }

    let response = self.transport.send(request.clone()).await?;
    if !degraded && policy.is_cacheable(response.status) {
      degraded = !write_store(store, &request, &response);
    }
    Ok(RouteOutcome::Served(
      CacheResult::from_network(response).degraded(degraded),
    ))
  }

  /// Refresh a store entry in the background. The caller already has its answer.
  fn spawn_revalidation(
    &self,
    store: NamedCacheStore,
    cacheable: BTreeSet<u16>,
    request: Request,
  ) -> JoinHandle<()> {
    let transport = Arc::clone(&self.transport);
    tokio::spawn(async move {
      match transport.send(request.clone()).await {
        Ok(response) if cacheable.contains(&response.status) => {
          write_store(&store, &request, &response);
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "Revalidation not cacheable")
        }
        Err(e) => debug!(url = %request.url, "Revalidation failed: {}", e),
      }
    })
  }

  async fn network_first(
    &self,
    policy: &CachePolicy,
    store: &NamedCacheStore,
    request: Request,
  ) -> Result<RouteOutcome, FetchError> {
    let failure = match self.transport.send(request.clone()).await {
      Ok(response) if response.is_success() => {
        let degraded = policy.is_cacheable(response.status) && !write_store(store, &request, &response);
        return Ok(RouteOutcome::Served(
          CacheResult::from_network(response).degraded(degraded),
        ));
      }
      Ok(response) => FetchError::Status(response.status),
      Err(e) => e,
    };

    debug!(url = %request.url, "Network failed, trying cache: {}", failure);
    let (cached, degraded) = read_store(store, |s, key| s.get(key), &request);
    match cached {
      Some(entry) => Ok(RouteOutcome::Served(
        CacheResult::offline(entry.to_response(), entry.stored_at).degraded(degraded),
      )),
      None => Err(failure),
    }
  }

  async fn network_only(
    &self,
    policy: &CachePolicy,
    request: Request,
  ) -> Result<RouteOutcome, FetchError> {
    let err = match self.transport.send(request.clone()).await {
      Ok(response) => return Ok(RouteOutcome::Served(CacheResult::from_network(response))),
      Err(e) => e,
    };

    if !err.is_transport() || !request.method.is_mutating() {
      return Err(err);
    }

    match policy.on_failure {
      FailureAction::Queue => {
        let domain = Domain::for_path(request.url.path());
        match self.queues.get(domain).enqueue_request(&request) {
          Ok(mutation) => Ok(RouteOutcome::Queued(mutation)),
          Err(e) => {
            warn!(%domain, "Could not queue failed write: {}", e);
            Err(err)
          }
        }
      }
      FailureAction::Record => {
        if let Err(e) = self.failed.record(&request) {
          warn!("Could not record failed request: {}", e);
        }
        Err(err)
      }
      FailureAction::Surface => Err(err),
    }
  }

  /// Delete every cache store no policy writes to any more.
  pub fn prune_obsolete_stores(&self) -> Result<Vec<String>> {
    let current = self.table.store_names();
    let mut pruned = Vec::new();
    for name in self.storage.store_names()? {
      if current.contains(name.as_str()) {
        continue;
      }
      let removed = self.storage.drop_store(&name)?;
      info!(store = %name, removed, "Deleted obsolete cache store");
      pruned.push(name);
    }
    Ok(pruned)
  }
}

/// Read through a store, turning a storage failure into a miss.
/// The flag reports whether the store failed.
fn read_store(
  store: &NamedCacheStore,
  read: impl FnOnce(&NamedCacheStore, &str) -> Result<Option<CacheEntry>>,
  request: &Request,
) -> (Option<CacheEntry>, bool) {
  match read(store, &request.identity()) {
    Ok(entry) => (entry, false),
    Err(e) => {
      warn!(store = store.name(), "Cache read failed, continuing network-only: {}", e);
      (None, true)
    }
  }
}

/// Store a response. Returns false if the store failed.
fn write_store(store: &NamedCacheStore, request: &Request, response: &Response) -> bool {
  match store.put(request, response) {
    Ok(()) => true,
    Err(e) => {
      warn!(store = store.name(), "Cache write failed: {}", e);
      false
    }
  }
}
