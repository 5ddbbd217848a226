//! Core types for the partitioned response cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix shared by every partition this agent creates.
pub const PARTITION_PREFIX: &str = "fieldcache";

/// What a partition is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionPurpose {
  Static,
  Dynamic,
  Api,
  OfflineQueue,
}

impl PartitionPurpose {
  pub const ALL: [PartitionPurpose; 4] = [
    PartitionPurpose::Static,
    PartitionPurpose::Dynamic,
    PartitionPurpose::Api,
    PartitionPurpose::OfflineQueue,
  ];

  fn label(self) -> &'static str {
    match self {
      PartitionPurpose::Static => "static",
      PartitionPurpose::Dynamic => "dynamic",
      PartitionPurpose::Api => "api",
      PartitionPurpose::OfflineQueue => "offline-queue",
    }
  }
}

/// The current partition names for one agent version.
///
/// Partition names embed the version token, so bumping the version makes
/// every older partition fall outside the allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSet {
  version: String,
}

impl PartitionSet {
  pub fn for_version(version: impl Into<String>) -> Self {
    Self {
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Name of the current partition for a purpose, e.g. `fieldcache-api-v1`.
  pub fn name(&self, purpose: PartitionPurpose) -> String {
    format!("{}-{}-{}", PARTITION_PREFIX, purpose.label(), self.version)
  }

  /// Whether a partition survives activation.
  pub fn is_current(&self, name: &str) -> bool {
    PartitionPurpose::ALL.iter().any(|p| self.name(*p) == name)
  }

  /// Whether a partition holds an offline queue, of any version.
  pub fn is_offline_queue(name: &str) -> bool {
    name
      .strip_prefix(PARTITION_PREFIX)
      .and_then(|rest| rest.strip_prefix('-'))
      .and_then(|rest| rest.strip_prefix(PartitionPurpose::OfflineQueue.label()))
      .is_some_and(|rest| rest.starts_with('-'))
  }
}

/// Key identifying a cached request: method plus the exact URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  /// Stable fixed-length hash used as the storage key
  pub hash: String,
  /// Human readable `METHOD URL`
  pub desc: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &str) -> Self {
    let desc = format!("{} {}", method.to_uppercase(), url);

    let mut hasher = Sha256::new();
    hasher.update(desc.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Self { hash, desc }
  }
}

/// A stored copy of an upstream response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  pub status: u16,
  /// Headers in the order they were received
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// When the snapshot was taken
  pub stored_at: DateTime<Utc>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers,
      body: body.into(),
      stored_at: Utc::now(),
    }
  }

  /// Build a JSON response manufactured by the agent itself.
  pub fn synthetic_json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(
      status,
      vec![("content-type".to_string(), "application/json".to_string())],
      value.to_string(),
    )
  }

  /// Only 2xx responses are ever written to a partition.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}
