use tokio::sync::oneshot;

use crate::agent::messenger::{ClientMessage, ControlMessage};
use crate::agent::request::AgentRequest;
use crate::agent::sync::SyncResult;
use crate::cache::ResponseSnapshot;

/// Events delivered to the agent from outside
#[derive(Debug)]
pub enum AgentEvent {
  /// Warm the static partition for this version
  Install,
  /// Reclaim stale partitions and take control
  Activate,
  /// An intercepted request
  Fetch(AgentRequest),
  /// A sync trigger carrying its tag
  Sync(String),
  /// A control command, with an optional channel for the reply
  Message(ControlMessage, Option<oneshot::Sender<ClientMessage>>),
}

/// What handling an event produced
#[derive(Debug)]
pub enum EventOutcome {
  Installed { waiting: bool },
  Activated { deleted: Vec<String> },
  Response(ResponseSnapshot),
  /// `None` when the tag was not ours
  Synced(Option<SyncResult>),
  Handled,
}
