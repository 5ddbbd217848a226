//! Caching strategies, one per traffic class.
//!
//! Every strategy performs at most one cache write per request and at most
//! one queue append per failed mutation. Cache read/write failures are
//! logged and treated as a miss; they never fail a live response.

use std::sync::Arc;
use tracing::{debug, error, warn};

use super::classify::{classify, TrafficClass};
use super::queue::{OfflineQueue, QueuedRequest};
use super::request::{self, AgentRequest, Destination};
use crate::cache::{CacheStorage, PartitionPurpose, PartitionSet, RequestKey, ResponseSnapshot};
use crate::config::{DocumentsConfig, RoutingConfig};
use crate::error::Result;
use crate::network::Network;

pub struct StrategyExecutor {
  store: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  queue: Arc<OfflineQueue>,
  partitions: PartitionSet,
  routing: RoutingConfig,
  documents: DocumentsConfig,
}

impl StrategyExecutor {
  pub fn new(
    store: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    queue: Arc<OfflineQueue>,
    partitions: PartitionSet,
    routing: RoutingConfig,
    documents: DocumentsConfig,
  ) -> Self {
    Self {
      store,
      network,
      queue,
      partitions,
      routing,
      documents,
    }
  }

  /// Classify a request and run the matching strategy.
  pub async fn handle(&self, req: &AgentRequest) -> Result<ResponseSnapshot> {
    let class = classify(req, &self.routing);
    debug!(method = %req.method, url = %req.url, ?class, "Handling request");

    match class {
      TrafficClass::Api => self.network_first_api(req).await,
      TrafficClass::Static => self.cache_first_static(req).await,
      TrafficClass::Navigation => self.network_first_document(req).await,
      TrafficClass::Other => self.network_first_default(req).await,
      TrafficClass::Passthrough => self.network.fetch(req).await,
    }
  }

  /// Network first; cacheable reads are kept, failed mutations are queued.
  async fn network_first_api(&self, req: &AgentRequest) -> Result<ResponseSnapshot> {
    let partition = self.partitions.name(PartitionPurpose::Api);

    match self.network.fetch(req).await {
      Ok(response) => {
        if req.is_cacheable_method()
          && response.is_success()
          && self.routing.is_cacheable_api(req.url.path())
        {
          self.write(&partition, &req.cache_key(), &response);
        }
        Ok(response)
      }
      Err(e) if req.is_read() => {
        debug!(url = %req.url, error = %e, "API read failed, trying cache");
        Ok(
          self
            .read(&partition, &req.cache_key())
            .unwrap_or_else(request::offline_response),
        )
      }
      Err(e) => {
        debug!(method = %req.method, url = %req.url, error = %e, "API mutation failed, queuing");
        match self.queue.append(QueuedRequest::from_request(req)).await {
          Ok(()) => Ok(request::queued_response()),
          Err(queue_err) => {
            error!(
              method = %req.method,
              url = %req.url,
              error = %queue_err,
              "Mutation could not be queued and may be lost"
            );
            Ok(request::queue_unavailable_response(&queue_err.to_string()))
          }
        }
      }
    }
  }

  /// Cache first with a background refresh on hit.
  async fn cache_first_static(&self, req: &AgentRequest) -> Result<ResponseSnapshot> {
    let partition = self.partitions.name(PartitionPurpose::Static);
    let key = req.cache_key();

    if let Some(cached) = self.read(&partition, &key) {
      self.spawn_refresh(partition, key, req.clone());
      return Ok(cached);
    }

    match self.network.fetch(req).await {
      Ok(response) => {
        if req.is_cacheable_method() && response.is_success() {
          self.write(&partition, &key, &response);
        }
        Ok(response)
      }
      Err(e) if req.destination == Destination::Image => {
        debug!(url = %req.url, error = %e, "Image unavailable, serving placeholder");
        match self.placeholder(req) {
          Some(placeholder) => Ok(placeholder),
          None => Err(e),
        }
      }
      Err(e) => Err(e),
    }
  }

  /// Network first, then the cached document, then the offline document.
  async fn network_first_document(&self, req: &AgentRequest) -> Result<ResponseSnapshot> {
    let partition = self.partitions.name(PartitionPurpose::Dynamic);
    let key = req.cache_key();

    match self.network.fetch(req).await {
      Ok(response) => {
        if req.is_cacheable_method() && response.is_success() {
          self.write(&partition, &key, &response);
        }
        Ok(response)
      }
      Err(e) => {
        debug!(url = %req.url, error = %e, "Navigation failed, serving cached document");
        let fallback = self
          .match_any(&key)
          .or_else(|| self.document(req, &self.documents.offline))
          .or_else(|| self.document(req, &self.documents.shell))
          .unwrap_or_else(request::offline_response);
        Ok(fallback)
      }
    }
  }

  /// Network first, cache fallback from any partition.
  async fn network_first_default(&self, req: &AgentRequest) -> Result<ResponseSnapshot> {
    let key = req.cache_key();

    match self.network.fetch(req).await {
      Ok(response) => {
        if req.is_cacheable_method() && response.is_success() {
          let partition = self.partitions.name(PartitionPurpose::Dynamic);
          self.write(&partition, &key, &response);
        }
        Ok(response)
      }
      Err(e) => {
        debug!(url = %req.url, error = %e, "Request failed, trying every partition");
        Ok(self.match_any(&key).unwrap_or_else(request::offline_response))
      }
    }
  }

  fn spawn_refresh(&self, partition: String, key: RequestKey, req: AgentRequest) {
    let store = Arc::clone(&self.store);
    let network = Arc::clone(&self.network);

    tokio::spawn(async move {
      match network.fetch(&req).await {
        Ok(response) if response.is_success() => {
          if let Err(e) = store.put(&partition, &key, &response) {
            debug!(url = %req.url, error = %e, "Background refresh not stored");
          }
        }
        Ok(response) => {
          debug!(url = %req.url, status = response.status, "Background refresh skipped")
        }
        Err(e) => debug!(url = %req.url, error = %e, "Background refresh failed"),
      }
    });
  }

  fn placeholder(&self, req: &AgentRequest) -> Option<ResponseSnapshot> {
    let url = req.url.join(&self.documents.placeholder_image).ok()?;
    let key = RequestKey::new("GET", url.as_str());
    self.read(&self.partitions.name(PartitionPurpose::Static), &key)
  }

  /// A same-origin document from any partition.
  fn document(&self, req: &AgentRequest, path: &str) -> Option<ResponseSnapshot> {
    let url = req.url.join(path).ok()?;
    self.match_any(&RequestKey::new("GET", url.as_str()))
  }

  fn read(&self, partition: &str, key: &RequestKey) -> Option<ResponseSnapshot> {
    self.store.get(partition, key).unwrap_or_else(|e| {
      warn!(partition, request = %key.desc, error = %e, "Cache read failed");
      None
    })
  }

  fn match_any(&self, key: &RequestKey) -> Option<ResponseSnapshot> {
    self.store.match_any(key).unwrap_or_else(|e| {
      warn!(request = %key.desc, error = %e, "Cache lookup failed");
      None
    })
  }

  fn write(&self, partition: &str, key: &RequestKey, response: &ResponseSnapshot) {
    if let Err(e) = self.store.put(partition, key, response) {
      warn!(partition, request = %key.desc, error = %e, "Cache write failed");
    }
  }
}
