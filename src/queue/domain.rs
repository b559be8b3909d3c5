//! The fixed set of data domains, each with its own store, tag and endpoint.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::UnknownVariant;
use crate::scheduler::SyncTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Domain {
  /// Any API write that failed while offline
  Generic,
  Gamification,
  Gesture,
  SocialShare,
}

impl Domain {
  pub const ALL: [Domain; 4] = [
    Domain::Generic,
    Domain::Gamification,
    Domain::Gesture,
    Domain::SocialShare,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Domain::Generic => "generic",
      Domain::Gamification => "gamification",
      Domain::Gesture => "gesture",
      Domain::SocialShare => "social-share",
    }
  }

  /// Durable store holding this domain's queue.
  pub fn store_name(self) -> &'static str {
    match self {
      Domain::Generic => "offline-queue",
      Domain::Gamification => "gamification-pending",
      Domain::Gesture => "gesture-pending",
      Domain::SocialShare => "share-pending",
    }
  }

  /// Trigger tag whose firing replays this domain.
  pub fn tag(self) -> SyncTag {
    match self {
      Domain::Generic | Domain::SocialShare => SyncTag::OfflineQueue,
      Domain::Gamification => SyncTag::GamificationSync,
      Domain::Gesture => SyncTag::GestureSync,
    }
  }

  /// Fixed endpoint payloads are POSTed to. Generic entries replay their own request.
  pub fn endpoint(self) -> Option<&'static str> {
    match self {
      Domain::Generic => None,
      Domain::Gamification => Some("/api/gamification/sync"),
      Domain::Gesture => Some("/api/gestures/sync"),
      Domain::SocialShare => Some("/api/sync/share"),
    }
  }

  /// Domain a failed write to `path` is queued under.
  pub fn for_path(path: &str) -> Domain {
    if path.starts_with("/api/gamification/") {
      Domain::Gamification
    } else if path.starts_with("/api/gestures/") {
      Domain::Gesture
    } else if path == "/api/sync/share" || path.starts_with("/api/share") {
      Domain::SocialShare
    } else {
      Domain::Generic
    }
  }
}

impl fmt::Display for Domain {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Domain {
  type Err = UnknownVariant;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Domain::ALL
      .into_iter()
      .find(|d| d.as_str() == s)
      .ok_or_else(|| UnknownVariant::new("domain", s))
  }
}
