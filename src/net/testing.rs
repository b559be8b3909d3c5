//! In-process transport for tests.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{Request, Response, Transport};
use crate::error::FetchError;

type Handler = Box<dyn FnMut(&Request) -> Result<Response, FetchError> + Send>;

/// Transport whose answers come from a closure, with an online switch and a call log.
pub struct ScriptedTransport {
  online: AtomicBool,
  handler: Mutex<Handler>,
  calls: Mutex<Vec<Request>>,
}

impl ScriptedTransport {
  pub fn new<F>(handler: F) -> Arc<Self>
  where
    F: FnMut(&Request) -> Result<Response, FetchError> + Send + 'static,
  {
    Arc::new(Self {
      online: AtomicBool::new(true),
      handler: Mutex::new(Box::new(handler)),
      calls: Mutex::new(Vec::new()),
    })
  }

  /// Answers every request with `200` and the given body.
  pub fn ok(body: &'static str) -> Arc<Self> {
    Self::new(move |_| Ok(Response::new(200, body)))
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

impl Transport for ScriptedTransport {
  fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, FetchError>> {
    let result = if self.online.load(Ordering::SeqCst) {
      self.calls.lock().unwrap().push(request.clone());
      (self.handler.lock().unwrap())(&request)
    } else {
      Err(FetchError::Offline("offline".to_string()))
    };
    Box::pin(async move {
      tokio::task::yield_now().await;
      result
    })
  }
}
