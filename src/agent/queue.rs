//! Durable queue of mutations made while the origin was unreachable.
//!
//! The whole queue is one JSON array stored under a single key in the
//! offline-queue partition. Every read-modify-write goes through one async
//! lock, so two mutations failing at the same moment cannot overwrite each
//! other's record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::request::AgentRequest;
use crate::cache::CacheStorage;
use crate::error::{AgentError, Result};

/// Key of the single stored value holding the queue.
pub const QUEUE_KEY: &str = "queued-requests";

static RECORD_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One mutation waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
  #[serde(default)]
  pub id: String,
  pub url: String,
  pub method: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<String>,
  pub enqueued_at: DateTime<Utc>,
  /// Failed replays so far
  #[serde(default)]
  pub attempts: u32,
}

impl QueuedRequest {
  pub fn from_request(req: &AgentRequest) -> Self {
    let enqueued_at = Utc::now();
    let seq = RECORD_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(req.method.as_str().as_bytes());
    hasher.update(req.url.as_str().as_bytes());
    hasher.update(enqueued_at.to_rfc3339().as_bytes());
    hasher.update(seq.to_le_bytes());
    let id = hex::encode(&hasher.finalize()[..8]);

    Self {
      id,
      url: req.url.to_string(),
      method: req.method.as_str().to_string(),
      headers: req.headers.clone(),
      body: req.body_text(),
      enqueued_at,
      attempts: 0,
    }
  }
}

/// Handle used to ask the delayed-retry facility for a sync later.
#[derive(Clone)]
pub struct SyncRegistrar {
  tx: mpsc::UnboundedSender<String>,
}

impl SyncRegistrar {
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }

  /// Best effort: a facility that has gone away is ignored.
  pub fn register(&self, tag: &str) {
    if self.tx.send(tag.to_string()).is_err() {
      debug!(tag, "Delayed retry facility not running");
    }
  }
}

pub struct OfflineQueue {
  store: Arc<dyn CacheStorage>,
  partition: String,
  sync_tag: String,
  registrar: Option<SyncRegistrar>,
  write_lock: Mutex<()>,
  /// Bumped by every `clear`; a sync pass that started under an older
  /// generation must not write its failures back.
  generation: AtomicU64,
}

impl OfflineQueue {
  pub fn new(store: Arc<dyn CacheStorage>, partition: String, sync_tag: String) -> Self {
    Self {
      store,
      partition,
      sync_tag,
      registrar: None,
      write_lock: Mutex::new(()),
      generation: AtomicU64::new(0),
    }
  }

  pub fn with_registrar(mut self, registrar: SyncRegistrar) -> Self {
    self.registrar = Some(registrar);
    self
  }

  /// Add a mutation to the end of the queue and register for a later sync.
  pub async fn append(&self, record: QueuedRequest) -> Result<()> {
    {
      let _guard = self.write_lock.lock().await;
      let mut records = self
        .load()
        .map_err(|e| AgentError::QueueWrite(e.to_string()))?;
      info!(
        method = %record.method,
        url = %record.url,
        pending = records.len() + 1,
        "Queued request for sync"
      );
      records.push(record);
      self.store_all(&records)?;
    }

    if let Some(registrar) = &self.registrar {
      registrar.register(&self.sync_tag);
    }
    Ok(())
  }

  /// Current queue contents in enqueue order.
  pub async fn read_all(&self) -> Result<Vec<QueuedRequest>> {
    self.load()
  }

  pub async fn len(&self) -> Result<usize> {
    Ok(self.load()?.len())
  }

  /// Overwrite the queue wholesale.
  pub async fn replace_all(&self, records: &[QueuedRequest]) -> Result<()> {
    let _guard = self.write_lock.lock().await;
    self.store_all(records)
  }

  /// Queue contents at the start of a sync pass, with the generation to hand
  /// back to `reconcile`.
  pub async fn begin_pass(&self) -> Result<(Vec<QueuedRequest>, u64)> {
    let _guard = self.write_lock.lock().await;
    Ok((self.load()?, self.generation.load(Ordering::SeqCst)))
  }

  /// Settle a sync pass: records that were attempted are replaced by the
  /// `kept` ones (the failures, in order); records appended while the pass
  /// was running are kept after them. If the queue was cleared since the
  /// pass began, the pass's failures are discarded.
  pub async fn reconcile(
    &self,
    generation: u64,
    attempted: &[String],
    kept: Vec<QueuedRequest>,
  ) -> Result<()> {
    let _guard = self.write_lock.lock().await;
    let attempted: HashSet<&str> = attempted.iter().map(String::as_str).collect();

    let current = self.load()?;
    let arrived: Vec<QueuedRequest> = current
      .into_iter()
      .filter(|r| !attempted.contains(r.id.as_str()))
      .collect();

    if generation != self.generation.load(Ordering::SeqCst) {
      info!(discarded = kept.len(), "Queue cleared during sync pass");
      if arrived.is_empty() {
        return Ok(());
      }
      return self.store_all(&arrived);
    }

    let mut records = kept;
    records.extend(arrived);
    self.store_all(&records)
  }

  /// Drop every queued record. Returns whether anything was stored.
  pub async fn clear(&self) -> Result<bool> {
    let _guard = self.write_lock.lock().await;
    self.generation.fetch_add(1, Ordering::SeqCst);
    let removed = self.store.delete(&self.partition)?;
    if removed {
      info!(partition = %self.partition, "Offline queue cleared");
    }
    Ok(removed)
  }

  /// Move the records of another version's queue in front of ours. Returns
  /// how many were carried over; the old partition itself is left alone.
  pub async fn adopt(&self, partition: &str) -> Result<usize> {
    let _guard = self.write_lock.lock().await;
    let mut records = match self.load_from(partition) {
      Ok(records) => records,
      Err(e) => {
        warn!(partition, error = %e, "Unreadable offline queue left behind");
        return Ok(0);
      }
    };
    if records.is_empty() {
      return Ok(0);
    }

    let carried = records.len();
    records.extend(self.load()?);
    self.store_all(&records)?;
    Ok(carried)
  }

  fn load(&self) -> Result<Vec<QueuedRequest>> {
    self.load_from(&self.partition)
  }

  fn load_from(&self, partition: &str) -> Result<Vec<QueuedRequest>> {
    match self.store.get_value(partition, QUEUE_KEY)? {
      Some(json) => {
        let mut records: Vec<QueuedRequest> = serde_json::from_str(&json)?;
        // Records written without an id still need to be addressable
        for (i, record) in records.iter_mut().enumerate() {
          if record.id.is_empty() {
            record.id = format!("legacy-{}-{}", record.enqueued_at.timestamp_millis(), i);
          }
        }
        Ok(records)
      }
      None => Ok(Vec::new()),
    }
  }

  fn store_all(&self, records: &[QueuedRequest]) -> Result<()> {
    let json = serde_json::to_string(records).map_err(|e| AgentError::QueueWrite(e.to_string()))?;
    self
      .store
      .put_value(&self.partition, QUEUE_KEY, &json)
      .map_err(|e| {
        warn!(error = %e, "Offline queue write failed");
        AgentError::QueueWrite(e.to_string())
      })
  }
}
