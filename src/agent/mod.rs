//! The interception engine.
//!
//! `Agent` owns its storage handles and the transport; every externally
//! delivered event goes through [`Agent::dispatch`].

pub mod classify;
pub mod lifecycle;
pub mod messenger;
pub mod queue;
pub mod request;
pub mod strategy;
pub mod sync;

use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheStorage, PartitionPurpose, PartitionSet, ResponseSnapshot};
use crate::config::{Config, DocumentsConfig, RoutingConfig, SyncConfig};
use crate::error::Result;
use crate::event::{AgentEvent, EventOutcome};
use crate::network::Network;

use lifecycle::{LifecycleManager, LifecycleState};
use messenger::{ClientMessage, ControlMessage, Messenger};
use queue::{OfflineQueue, SyncRegistrar};
use request::AgentRequest;
use strategy::StrategyExecutor;
use sync::{SyncCoordinator, SyncResult, SyncState};

/// Everything the engine needs to know from configuration.
#[derive(Debug, Clone)]
pub struct AgentSettings {
  pub partitions: PartitionSet,
  pub origin: Url,
  pub routing: RoutingConfig,
  pub documents: DocumentsConfig,
  pub precache: Vec<String>,
  pub sync: SyncConfig,
}

impl AgentSettings {
  pub fn from_config(config: &Config) -> color_eyre::Result<Self> {
    Ok(Self {
      partitions: PartitionSet::for_version(config.cache.version.clone()),
      origin: config.upstream()?.clone(),
      routing: config.routing.clone(),
      documents: config.documents.clone(),
      precache: config.precache.clone(),
      sync: config.sync.clone(),
    })
  }
}

/// Snapshot of the agent for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentStatus {
  pub version: String,
  pub lifecycle: LifecycleState,
  pub sync: SyncState,
  pub queued: usize,
  pub partitions: Vec<String>,
  pub clients: usize,
}

pub struct Agent {
  store: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  messenger: Messenger,
  queue: Arc<OfflineQueue>,
  lifecycle: LifecycleManager,
  executor: StrategyExecutor,
  sync: Arc<SyncCoordinator>,
  partitions: PartitionSet,
}

impl Agent {
  pub fn new(
    settings: AgentSettings,
    store: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    registrar: Option<SyncRegistrar>,
  ) -> Self {
    let messenger = Messenger::new();
    let partitions = settings.partitions;

    let mut queue = OfflineQueue::new(
      Arc::clone(&store),
      partitions.name(PartitionPurpose::OfflineQueue),
      settings.sync.tag.clone(),
    );
    if let Some(registrar) = registrar {
      queue = queue.with_registrar(registrar);
    }
    let queue = Arc::new(queue);

    let lifecycle = LifecycleManager::new(
      Arc::clone(&store),
      Arc::clone(&network),
      messenger.clone(),
      Arc::clone(&queue),
      partitions.clone(),
      settings.origin,
      settings.precache,
    );
    let executor = StrategyExecutor::new(
      Arc::clone(&store),
      Arc::clone(&network),
      Arc::clone(&queue),
      partitions.clone(),
      settings.routing,
      settings.documents,
    );
    let sync = Arc::new(SyncCoordinator::new(
      Arc::clone(&queue),
      Arc::clone(&network),
      messenger.clone(),
      settings.sync.tag,
      settings.sync.max_attempts,
    ));

    Self {
      store,
      network,
      messenger,
      queue,
      lifecycle,
      executor,
      sync,
      partitions,
    }
  }

  pub fn messenger(&self) -> &Messenger {
    &self.messenger
  }

  pub fn sync_coordinator(&self) -> Arc<SyncCoordinator> {
    Arc::clone(&self.sync)
  }

  pub fn sync_tag(&self) -> &str {
    self.sync.tag()
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn lifecycle_state(&self) -> LifecycleState {
    self.lifecycle.state()
  }

  /// Install, then activate straight away unless an older version is still
  /// in control, in which case activation waits for `SKIP_WAITING`.
  ///
  /// A version installed by an earlier run is resumed without refetching the
  /// manifest, so the agent can start while the origin is unreachable.
  pub async fn start(&self) -> Result<LifecycleState> {
    let waiting = if self.lifecycle.has_installed_partition()? {
      self.lifecycle.resume();
      self.lifecycle.should_wait()?
    } else {
      match self.dispatch(AgentEvent::Install).await? {
        EventOutcome::Installed { waiting } => waiting,
        _ => true,
      }
    };

    if !waiting {
      self.dispatch(AgentEvent::Activate).await?;
    }
    Ok(self.lifecycle.state())
  }

  pub async fn dispatch(&self, event: AgentEvent) -> Result<EventOutcome> {
    match event {
      AgentEvent::Install => self.on_install().await,
      AgentEvent::Activate => self.on_activate().await,
      AgentEvent::Fetch(req) => self.on_fetch(req).await.map(EventOutcome::Response),
      AgentEvent::Sync(tag) => self.sync.sync(&tag).await.map(EventOutcome::Synced),
      AgentEvent::Message(msg, reply) => self.on_message(msg, reply).await,
    }
  }

  /// Convenience wrapper around `dispatch(Fetch)`.
  pub async fn fetch(&self, req: AgentRequest) -> Result<ResponseSnapshot> {
    self.on_fetch(req).await
  }

  /// Convenience wrapper around `dispatch(Sync)`.
  pub async fn sync(&self, tag: &str) -> Result<Option<SyncResult>> {
    self.sync.sync(tag).await
  }

  pub async fn status(&self) -> Result<AgentStatus> {
    Ok(AgentStatus {
      version: self.partitions.version().to_string(),
      lifecycle: self.lifecycle.state(),
      sync: self.sync.state(),
      queued: self.queue.len().await?,
      partitions: self.store.partitions()?,
      clients: self.messenger.client_count(),
    })
  }

  async fn on_install(&self) -> Result<EventOutcome> {
    self.lifecycle.install().await?;
    let waiting = self.lifecycle.should_wait()?;
    if waiting {
      info!("Older version in control; waiting for SKIP_WAITING");
    }
    Ok(EventOutcome::Installed { waiting })
  }

  async fn on_activate(&self) -> Result<EventOutcome> {
    let deleted = self.lifecycle.activate().await?;
    Ok(EventOutcome::Activated { deleted })
  }

  async fn on_fetch(&self, req: AgentRequest) -> Result<ResponseSnapshot> {
    if !self.lifecycle.is_controlling() {
      debug!(url = %req.url, "Not controlling yet, passing through");
      return self.network.fetch(&req).await;
    }
    self.executor.handle(&req).await
  }

  async fn on_message(
    &self,
    msg: ControlMessage,
    reply: Option<tokio::sync::oneshot::Sender<ClientMessage>>,
  ) -> Result<EventOutcome> {
    match msg {
      ControlMessage::SkipWaiting => {
        info!("Received SKIP_WAITING");
        if self.lifecycle.state() == LifecycleState::Installed {
          self.lifecycle.activate().await?;
        }
      }
      ControlMessage::ClearCache => {
        // Through the queue first so an in-flight sync pass cannot restore it
        let queue_removed = self.queue.clear().await?;
        let removed = self.store.delete_all()? + usize::from(queue_removed);
        info!(removed, "Cleared all partitions");
        if let Some(reply) = reply {
          // The caller may have stopped waiting
          let _ = reply.send(ClientMessage::CacheCleared { success: true });
        }
      }
    }
    Ok(EventOutcome::Handled)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use super::queue::QueuedRequest;
  use crate::cache::MemoryStorage;
  use crate::error::AgentError;
  use crate::network::testing::MockNetwork;
  use async_trait::async_trait;
  use reqwest::Method;
  use tokio::sync::{oneshot, Notify};

  /// Serves GETs; holds every POST until released, then fails it.
  struct GatedNetwork {
    started: Notify,
    release: Notify,
  }

  #[async_trait]
  impl Network for GatedNetwork {
    async fn fetch(&self, req: &AgentRequest) -> Result<ResponseSnapshot> {
      if req.method == Method::POST {
        self.started.notify_one();
        self.release.notified().await;
        return Err(AgentError::Network("connection refused".into()));
      }
      Ok(ResponseSnapshot::new(200, vec![], "<html>shell</html>"))
    }
  }

  fn settings(version: &str) -> AgentSettings {
    AgentSettings {
      partitions: PartitionSet::for_version(version),
      origin: Url::parse("http://app.local/").unwrap(),
      routing: RoutingConfig::default(),
      documents: DocumentsConfig::default(),
      precache: vec!["/index.html".into()],
      sync: SyncConfig::default(),
    }
  }

  fn network() -> Arc<MockNetwork> {
    let network = Arc::new(MockNetwork::new());
    network.route(
      "GET",
      "http://app.local/index.html",
      ResponseSnapshot::new(200, vec![], "<html>shell</html>"),
    );
    network
  }

  #[tokio::test]
  async fn test_first_start_activates_immediately() {
    let agent = Agent::new(settings("v1"), Arc::new(MemoryStorage::new()), network(), None);
    assert_eq!(agent.start().await.unwrap(), LifecycleState::Activated);
  }

  #[tokio::test]
  async fn test_restart_offline_resumes_control() {
    let store = Arc::new(MemoryStorage::new());
    let first = Agent::new(settings("v1"), store.clone(), network(), None);
    first.start().await.unwrap();
    drop(first);

    let offline = network();
    offline.set_offline(true);
    let second = Agent::new(settings("v1"), store, offline, None);
    assert_eq!(second.start().await.unwrap(), LifecycleState::Activated);

    let nav = AgentRequest::get(Url::parse("http://app.local/index.html").unwrap()).navigate();
    let response = second.fetch(nav).await.unwrap();
    assert_eq!(response.body, b"<html>shell</html>");
  }

  #[tokio::test]
  async fn test_upgrade_waits_for_skip_waiting() {
    let store = Arc::new(MemoryStorage::new());
    store.open("fieldcache-dynamic-v1").unwrap();
    let network = network();
    let agent = Agent::new(settings("v2"), store.clone(), network.clone(), None);

    assert_eq!(agent.start().await.unwrap(), LifecycleState::Installed);

    // Not in control: a failing mutation is not queued
    network.set_offline(true);
    let post = AgentRequest::new(Method::POST, Url::parse("http://app.local/api/x").unwrap());
    assert!(agent.fetch(post.clone()).await.is_err());
    assert_eq!(agent.queue().len().await.unwrap(), 0);

    agent
      .dispatch(AgentEvent::Message(ControlMessage::SkipWaiting, None))
      .await
      .unwrap();
    assert_eq!(agent.lifecycle_state(), LifecycleState::Activated);
    assert!(!store
      .partitions()
      .unwrap()
      .contains(&"fieldcache-dynamic-v1".to_string()));

    let response = agent.fetch(post).await.unwrap();
    assert_eq!(response.status, 202);
    assert_eq!(agent.queue().len().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_clear_cache_replies_after_purge() {
    let store = Arc::new(MemoryStorage::new());
    let network = network();
    let agent = Agent::new(settings("v1"), store.clone(), network.clone(), None);
    agent.start().await.unwrap();

    network.set_offline(true);
    let post = AgentRequest::new(Method::POST, Url::parse("http://app.local/api/x").unwrap());
    agent.fetch(post).await.unwrap();
    assert!(!store.partitions().unwrap().is_empty());

    let (tx, rx) = oneshot::channel();
    agent
      .dispatch(AgentEvent::Message(ControlMessage::ClearCache, Some(tx)))
      .await
      .unwrap();
    assert_eq!(rx.await.unwrap(), ClientMessage::CacheCleared { success: true });
    assert!(store.partitions().unwrap().is_empty());
    assert_eq!(agent.queue().len().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_clear_cache_during_sync_pass_stays_cleared() {
    let network = Arc::new(GatedNetwork {
      started: Notify::new(),
      release: Notify::new(),
    });
    let agent = Arc::new(Agent::new(
      settings("v1"),
      Arc::new(MemoryStorage::new()),
      network.clone(),
      None,
    ));
    agent.start().await.unwrap();

    let post = AgentRequest::new(Method::POST, Url::parse("http://app.local/api/x").unwrap());
    agent
      .queue()
      .append(QueuedRequest::from_request(&post))
      .await
      .unwrap();

    let pass = {
      let agent = Arc::clone(&agent);
      tokio::spawn(async move { agent.sync("sync-queue").await })
    };
    network.started.notified().await;

    let (tx, rx) = oneshot::channel();
    agent
      .dispatch(AgentEvent::Message(ControlMessage::ClearCache, Some(tx)))
      .await
      .unwrap();
    assert_eq!(rx.await.unwrap(), ClientMessage::CacheCleared { success: true });
    assert_eq!(agent.queue().len().await.unwrap(), 0);

    network.release.notify_one();
    let result = pass.await.unwrap().unwrap().unwrap();
    assert_eq!(result.failed, 1);
    assert_eq!(agent.queue().len().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_sync_event_dispatch() {
    let agent = Agent::new(settings("v1"), Arc::new(MemoryStorage::new()), network(), None);
    agent.start().await.unwrap();

    match agent.dispatch(AgentEvent::Sync("sync-queue".into())).await.unwrap() {
      EventOutcome::Synced(Some(result)) => assert_eq!(result, SyncResult::default()),
      other => panic!("unexpected outcome {:?}", other),
    }
    match agent.dispatch(AgentEvent::Sync("nope".into())).await.unwrap() {
      EventOutcome::Synced(None) => {}
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_status_reports_queue_and_partitions() {
    let agent = Agent::new(settings("v1"), Arc::new(MemoryStorage::new()), network(), None);
    agent.start().await.unwrap();

    let status = agent.status().await.unwrap();
    assert_eq!(status.version, "v1");
    assert_eq!(status.lifecycle, LifecycleState::Activated);
    assert_eq!(status.sync, SyncState::Idle);
    assert_eq!(status.queued, 0);
    assert_eq!(status.partitions, vec!["fieldcache-static-v1"]);
  }
}
