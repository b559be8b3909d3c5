//! The `{type, data}` envelope exchanged with the foreground.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

use crate::scheduler::SyncTag;
use crate::status::SyncSession;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentMessage {
  /// Activate a waiting agent immediately
  SkipWaiting,
  StoreGamificationData(serde_json::Value),
  StoreGestureData(serde_json::Value),
  /// Foreground asked for a sync now
  SyncRequested { tag: SyncTag },
  ContentUpdated { url: String },
  GamificationSynced { count: usize },
  GesturesSynced { count: usize },
  SyncStatus(SyncSession),
}

impl AgentMessage {
  pub fn parse(line: &str) -> Result<Self> {
    serde_json::from_str(line).map_err(|e| eyre!("Failed to parse message: {}", e))
  }

  pub fn to_line(&self) -> Result<String> {
    serde_json::to_string(self).map_err(|e| eyre!("Failed to serialize message: {}", e))
  }
}
