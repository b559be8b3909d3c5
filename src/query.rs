//! Live search suggestions.
//!
//! This is the one fetch that can be abandoned: typing a new term aborts the
//! request still in flight for the previous one, so a slow answer for an old
//! term can never overwrite a newer one.
//!
//! # Example
//!
//! ```ignore
//! let mut query = SuggestionQuery::new(router.clone(), base_url);
//! query.search("ali");
//! query.search("alice"); // aborts "ali"
//!
//! // In the event loop
//! if query.poll() {
//!     if let Some(names) = query.data() { show(names) }
//! }
//! ```

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use crate::cache::{CacheRouter, RouteOutcome};
use crate::net::Request;

const SUGGESTIONS_PATH: &str = "/api/search/suggestions";

/// The state of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryState<T> {
  /// No search has been started
  Idle,
  Loading,
  Success(T),
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type Suggestions = Vec<String>;

pub struct SuggestionQuery {
  router: Arc<CacheRouter>,
  base_url: Url,
  state: QueryState<Suggestions>,
  term: Option<String>,
  receiver: Option<mpsc::UnboundedReceiver<Result<Suggestions, String>>>,
  in_flight: Option<JoinHandle<()>>,
}

impl SuggestionQuery {
  pub fn new(router: Arc<CacheRouter>, base_url: Url) -> Self {
    Self {
      router,
      base_url,
      state: QueryState::Idle,
      term: None,
      receiver: None,
      in_flight: None,
    }
  }

  pub fn state(&self) -> &QueryState<Suggestions> {
    &self.state
  }

  pub fn data(&self) -> Option<&Suggestions> {
    self.state.data()
  }

  pub fn term(&self) -> Option<&str> {
    self.term.as_deref()
  }

  /// Start fetching suggestions for `term`, aborting any earlier search.
  /// A blank term clears the query.
  pub fn search(&mut self, term: &str) {
    self.cancel();

    let term = term.trim();
    if term.is_empty() {
      self.term = None;
      self.state = QueryState::Idle;
      return;
    }

    let mut url = match self.base_url.join(SUGGESTIONS_PATH) {
      Ok(url) => url,
      Err(e) => {
        self.state = QueryState::Error(format!("Invalid suggestions URL: {}", e));
        return;
      }
    };
    url.query_pairs_mut().append_pair("q", term);

    let (tx, rx) = mpsc::unbounded_channel();
    let router = Arc::clone(&self.router);
    self.in_flight = Some(tokio::spawn(async move {
      let result = fetch(&router, Request::get(url)).await;
      // Ignore send errors - the query may have been dropped
      let _ = tx.send(result);
    }));
    self.receiver = Some(rx);
    self.term = Some(term.to_string());
    self.state = QueryState::Loading;
  }

  /// Abort the in-flight fetch, keeping whatever state was last shown.
  pub fn cancel(&mut self) {
    if let Some(handle) = self.in_flight.take() {
      if !handle.is_finished() {
        debug!(term = ?self.term, "Aborting superseded suggestion fetch");
      }
      handle.abort();
    }
    self.receiver = None;
    if self.state.is_loading() {
      self.state = QueryState::Idle;
    }
  }

  /// Pick up a finished fetch without blocking.
  ///
  /// Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let Some(receiver) = &mut self.receiver else {
      return false;
    };

    match receiver.try_recv() {
      Ok(result) => {
        self.apply(result);
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.apply(Err("Query was cancelled".to_string()));
        true
      }
    }
  }

  /// Wait for the current fetch to finish.
  pub async fn settle(&mut self) -> &QueryState<Suggestions> {
    if let Some(receiver) = &mut self.receiver {
      let result = receiver
        .recv()
        .await
        .unwrap_or_else(|| Err("Query was cancelled".to_string()));
      self.apply(result);
    }
    &self.state
  }

  fn apply(&mut self, result: Result<Suggestions, String>) {
    self.receiver = None;
    self.in_flight = None;
    self.state = match result {
      Ok(suggestions) => QueryState::Success(suggestions),
      Err(e) => QueryState::Error(e),
    };
  }
}

impl Drop for SuggestionQuery {
  fn drop(&mut self) {
    if let Some(handle) = self.in_flight.take() {
      handle.abort();
    }
  }
}

async fn fetch(router: &CacheRouter, request: Request) -> Result<Suggestions, String> {
  match router.route(request).await.map_err(|e| e.to_string())? {
    RouteOutcome::Served(result) if result.data.is_success() => {
      result.data.json().map_err(|e| e.to_string())
    }
    RouteOutcome::Served(result) => Err(format!("Suggestions failed with status {}", result.data.status)),
    RouteOutcome::Queued(_) => Err("Suggestion request was queued".to_string()),
  }
}
