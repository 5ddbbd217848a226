//! Replay of queued mutations once the origin is reachable again.

use reqwest::Method;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use super::messenger::Messenger;
use super::queue::{OfflineQueue, QueuedRequest};
use super::request::AgentRequest;
use crate::error::{AgentError, Result};
use crate::network::Network;

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
  pub successful: usize,
  pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
  Idle,
  Syncing,
}

pub struct SyncCoordinator {
  queue: Arc<OfflineQueue>,
  network: Arc<dyn Network>,
  messenger: Messenger,
  tag: String,
  max_attempts: Option<u32>,
  syncing: AtomicBool,
  /// Held for the length of a pass; later triggers wait their turn
  pass: Mutex<()>,
}

enum Replay {
  Succeeded,
  Failed,
  /// The record can never be replayed (bad url or method)
  Invalid,
}

impl SyncCoordinator {
  pub fn new(
    queue: Arc<OfflineQueue>,
    network: Arc<dyn Network>,
    messenger: Messenger,
    tag: String,
    max_attempts: Option<u32>,
  ) -> Self {
    Self {
      queue,
      network,
      messenger,
      tag,
      max_attempts,
      syncing: AtomicBool::new(false),
      pass: Mutex::new(()),
    }
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn state(&self) -> SyncState {
    if self.syncing.load(Ordering::SeqCst) {
      SyncState::Syncing
    } else {
      SyncState::Idle
    }
  }

  /// Handle a sync trigger. Tags other than ours are ignored.
  pub async fn sync(&self, tag: &str) -> Result<Option<SyncResult>> {
    if tag != self.tag {
      debug!(tag, "Ignoring sync trigger with unknown tag");
      return Ok(None);
    }
    self.run_pass().await.map(Some)
  }

  async fn run_pass(&self) -> Result<SyncResult> {
    let _pass = self.pass.lock().await;
    self.syncing.store(true, Ordering::SeqCst);
    let outcome = self.replay_queue().await;
    self.syncing.store(false, Ordering::SeqCst);

    let result = outcome?;
    self.messenger.sync_complete(&result);
    Ok(result)
  }

  async fn replay_queue(&self) -> Result<SyncResult> {
    let (records, generation) = self.queue.begin_pass().await?;
    if !records.is_empty() {
      info!(pending = records.len(), "Starting sync pass");
    }

    let mut result = SyncResult::default();
    let mut attempted = Vec::with_capacity(records.len());
    let mut kept = Vec::new();

    for mut record in records {
      attempted.push(record.id.clone());

      match self.replay(&record).await {
        Replay::Succeeded => result.successful += 1,
        Replay::Invalid => {
          result.failed += 1;
          warn!(id = %record.id, url = %record.url, "Dropping queued request that cannot be replayed");
        }
        Replay::Failed => {
          result.failed += 1;
          record.attempts += 1;
          if self.max_attempts.is_some_and(|max| record.attempts >= max) {
            warn!(
              id = %record.id,
              url = %record.url,
              attempts = record.attempts,
              "Dropping queued request after too many failed replays"
            );
          } else {
            kept.push(record);
          }
        }
      }
    }

    self.queue.reconcile(generation, &attempted, kept).await?;

    info!(
      successful = result.successful,
      failed = result.failed,
      "Sync pass complete"
    );
    Ok(result)
  }

  async fn replay(&self, record: &QueuedRequest) -> Replay {
    let req = match to_request(record) {
      Ok(req) => req,
      Err(e) => {
        debug!(error = %e, "Invalid queued request");
        return Replay::Invalid;
      }
    };

    match self.network.fetch(&req).await {
      Ok(response) if response.is_success() => {
        debug!(method = %record.method, url = %record.url, "Replayed queued request");
        Replay::Succeeded
      }
      Ok(response) => {
        warn!(
          method = %record.method,
          url = %record.url,
          status = response.status,
          "Replay rejected by origin"
        );
        Replay::Failed
      }
      Err(e) => {
        debug!(method = %record.method, url = %record.url, error = %e, "Replay failed");
        Replay::Failed
      }
    }
  }
}

/// Rebuild the exact request that was queued.
fn to_request(record: &QueuedRequest) -> Result<AgentRequest> {
  let method = Method::from_bytes(record.method.as_bytes())
    .map_err(|e| AgentError::InvalidRequest(format!("method {}: {}", record.method, e)))?;
  let url = Url::parse(&record.url)
    .map_err(|e| AgentError::InvalidRequest(format!("url {}: {}", record.url, e)))?;

  let mut req = AgentRequest::new(method, url);
  req.headers = record.headers.clone();
  req.body = record.body.clone().map(String::into_bytes);
  Ok(req)
}

/// The delayed-retry facility.
///
/// Woken by queue registrations; probes the origin every `interval` and fires
/// the registered tag once the origin answers.
pub struct BackgroundSync {
  coordinator: Arc<SyncCoordinator>,
  network: Arc<dyn Network>,
  probe_url: Url,
  interval: Duration,
}

impl BackgroundSync {
  pub fn new(
    coordinator: Arc<SyncCoordinator>,
    network: Arc<dyn Network>,
    probe_url: Url,
    interval: Duration,
  ) -> Self {
    Self {
      coordinator,
      network,
      probe_url,
      interval,
    }
  }

  /// Run until every registrar is dropped.
  pub async fn run(self, mut registrations: mpsc::UnboundedReceiver<String>) {
    while let Some(tag) = registrations.recv().await {
      // Several appends while offline collapse into one pending sync
      while registrations.try_recv().is_ok() {}

      loop {
        if self.origin_reachable().await {
          info!(tag, "Connectivity restored, syncing");
          if let Err(e) = self.coordinator.sync(&tag).await {
            warn!(error = %e, "Background sync failed");
          }
          break;
        }
        debug!(interval = ?self.interval, "Origin unreachable, retrying later");
        tokio::time::sleep(self.interval).await;
      }
    }
    debug!("Background sync stopped");
  }

  async fn origin_reachable(&self) -> bool {
    let probe = AgentRequest::new(Method::HEAD, self.probe_url.clone());
    self.network.fetch(&probe).await.is_ok()
  }
}
