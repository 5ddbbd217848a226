//! Install and activate transitions.

use serde::Serialize;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use url::Url;

use super::messenger::{ClientMessage, Messenger};
use super::queue::OfflineQueue;
use super::request::AgentRequest;
use crate::cache::{CacheStorage, PartitionPurpose, PartitionSet, RequestKey};
use crate::error::{AgentError, Result};
use crate::network::Network;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Parsed,
  Installing,
  /// Installed, waiting for permission to take control
  Installed,
  Activating,
  Activated,
  /// Install failed; this version never takes control
  Redundant,
}

pub struct LifecycleManager {
  store: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  messenger: Messenger,
  queue: Arc<OfflineQueue>,
  partitions: PartitionSet,
  origin: Url,
  precache: Vec<String>,
  state: RwLock<LifecycleState>,
}

impl LifecycleManager {
  pub fn new(
    store: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    messenger: Messenger,
    queue: Arc<OfflineQueue>,
    partitions: PartitionSet,
    origin: Url,
    precache: Vec<String>,
  ) -> Self {
    Self {
      store,
      network,
      messenger,
      queue,
      partitions,
      origin,
      precache,
      state: RwLock::new(LifecycleState::Parsed),
    }
  }

  pub fn state(&self) -> LifecycleState {
    self
      .state
      .read()
      .map(|s| *s)
      .unwrap_or(LifecycleState::Redundant)
  }

  fn set_state(&self, state: LifecycleState) {
    if let Ok(mut s) = self.state.write() {
      *s = state;
    }
  }

  /// Whether intercepted requests go through the caching strategies.
  pub fn is_controlling(&self) -> bool {
    self.state() == LifecycleState::Activated
  }

  /// Warm the static partition with the precache manifest.
  ///
  /// Nothing is written unless every asset was fetched successfully.
  pub async fn install(&self) -> Result<()> {
    self.set_state(LifecycleState::Installing);
    info!(version = self.partitions.version(), assets = self.precache.len(), "Installing");

    let mut fetched = Vec::with_capacity(self.precache.len());
    for path in &self.precache {
      match self.fetch_asset(path).await {
        Ok(entry) => fetched.push(entry),
        Err(e) => {
          warn!(error = %e, "Install failed");
          self.set_state(LifecycleState::Redundant);
          return Err(e);
        }
      }
    }

    let partition = self.partitions.name(PartitionPurpose::Static);
    self.store.open(&partition)?;
    for (key, snapshot) in &fetched {
      self.store.put(&partition, key, snapshot)?;
    }

    self.set_state(LifecycleState::Installed);
    info!(partition, cached = fetched.len(), "Installed");
    Ok(())
  }

  async fn fetch_asset(&self, path: &str) -> Result<(RequestKey, crate::cache::ResponseSnapshot)> {
    let url = self.origin.join(path).map_err(|e| AgentError::Install {
      url: path.to_string(),
      reason: e.to_string(),
    })?;
    let req = AgentRequest::get(url.clone());

    let response = self.network.fetch(&req).await.map_err(|e| AgentError::Install {
      url: url.to_string(),
      reason: e.to_string(),
    })?;
    if !response.is_success() {
      return Err(AgentError::Install {
        url: url.to_string(),
        reason: format!("status {}", response.status),
      });
    }
    Ok((req.cache_key(), response))
  }

  /// Whether this version's static partition survives from an earlier run.
  pub fn has_installed_partition(&self) -> Result<bool> {
    let name = self.partitions.name(PartitionPurpose::Static);
    Ok(self.store.partitions()?.contains(&name))
  }

  /// Pick up an install done by an earlier run without refetching the manifest.
  pub fn resume(&self) {
    if self.state() == LifecycleState::Parsed {
      info!(version = self.partitions.version(), "Resuming installed version");
      self.set_state(LifecycleState::Installed);
    }
  }

  /// True when partitions of another version exist, meaning an older agent
  /// version has been in control and clients must opt in to the new one.
  pub fn should_wait(&self) -> Result<bool> {
    Ok(
      self
        .store
        .partitions()?
        .iter()
        .any(|name| !self.partitions.is_current(name)),
    )
  }

  /// Reclaim stale partitions and take control. Returns the deleted names.
  ///
  /// Mutations still queued under an older version are carried over to the
  /// current queue before their partition goes.
  pub async fn activate(&self) -> Result<Vec<String>> {
    match self.state() {
      LifecycleState::Activated => return Ok(Vec::new()),
      LifecycleState::Installed => {}
      other => {
        return Err(AgentError::InvalidRequest(format!(
          "cannot activate from state {:?}",
          other
        )))
      }
    }
    self.set_state(LifecycleState::Activating);

    let mut deleted = Vec::new();
    for name in self.store.partitions()? {
      if self.partitions.is_current(&name) {
        continue;
      }
      if PartitionSet::is_offline_queue(&name) {
        let carried = self.queue.adopt(&name).await?;
        if carried > 0 {
          warn!(from = %name, carried, "Carried queued requests over from an older version");
        }
      }
      if self.store.delete(&name)? {
        info!(partition = %name, "Deleted stale partition");
        deleted.push(name);
      }
    }

    self.set_state(LifecycleState::Activated);
    info!(version = self.partitions.version(), "Activated, now controlling clients");
    self.messenger.broadcast(ClientMessage::Activated {
      version: self.partitions.version().to_string(),
    });
    Ok(deleted)
  }
}
