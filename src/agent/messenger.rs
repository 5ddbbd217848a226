//! Messages exchanged between the agent and open application clients.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use super::sync::SyncResult;

/// Commands a client can send to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Take control now instead of waiting for old clients to go away
  SkipWaiting,
  /// Delete every partition, offline queue included
  ClearCache,
}

/// Messages the agent sends to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  SyncComplete { successful: usize, failed: usize },
  CacheCleared { success: bool },
  Activated { version: String },
}

/// Fan-out of agent notifications to every subscribed client.
#[derive(Clone)]
pub struct Messenger {
  tx: broadcast::Sender<ClientMessage>,
}

impl Messenger {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(64);
    Self { tx }
  }

  /// Register a client. Messages sent before this call are not replayed.
  pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
    self.tx.subscribe()
  }

  pub fn client_count(&self) -> usize {
    self.tx.receiver_count()
  }

  /// Deliver a message to every client currently subscribed.
  pub fn broadcast(&self, message: ClientMessage) {
    // No subscribers is not an error: nobody is listening right now
    match self.tx.send(message) {
      Ok(n) => debug!(clients = n, "Broadcast client message"),
      Err(broadcast::error::SendError(message)) => {
        debug!(?message, "No clients to notify")
      }
    }
  }

  pub fn sync_complete(&self, result: &SyncResult) {
    self.broadcast(ClientMessage::SyncComplete {
      successful: result.successful,
      failed: result.failed,
    });
  }
}

impl Default for Messenger {
  fn default() -> Self {
    Self::new()
  }
}
