//! Error types that callers need to branch on.
//!
//! Everything else in the crate reports through `color_eyre::Result`.

/// Classified failure of a single network exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
  /// The host could not reach the network at all (connect refused, DNS, no route).
  #[error("network unavailable: {0}")]
  Offline(String),
  /// The exchange started but did not complete (timeout, reset, body read).
  #[error("transport error: {0}")]
  Transport(String),
  /// The server answered with a status the caller does not accept.
  #[error("unexpected status {0}")]
  Status(u16),
}

impl FetchError {
  /// Transport-class failures are the ones that route to cache fallback or
  /// the offline queues. A status error means the server was reachable.
  pub fn is_transport(&self) -> bool {
    matches!(self, FetchError::Offline(_) | FetchError::Transport(_))
  }
}

/// Returned by the `FromStr` impls of the fixed vocabularies (methods, domains, tags).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
  pub kind: &'static str,
  pub value: String,
}

impl UnknownVariant {
  pub fn new(kind: &'static str, value: &str) -> Self {
    Self {
      kind,
      value: value.to_string(),
    }
  }
}
