//! Error types for the agent engine.

use thiserror::Error;

/// Errors raised inside the interception engine.
///
/// Most of these never reach the application: strategies turn network
/// failures into cached or synthetic responses. `QueueWrite` is kept apart so
/// a mutation that could not be persisted can be reported as possibly lost.
#[derive(Debug, Error)]
pub enum AgentError {
  /// Transport-level failure talking to the upstream origin.
  #[error("network error: {0}")]
  Network(String),

  /// Cache store failure.
  #[error("storage error: {0}")]
  Storage(String),

  /// The offline queue could not be persisted.
  #[error("failed to persist offline queue: {0}")]
  QueueWrite(String),

  /// Snapshot or queue (de)serialization failure.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Install aborted because a manifest asset could not be fetched.
  #[error("install failed for {url}: {reason}")]
  Install { url: String, reason: String },

  /// The intercepted request could not be turned into an upstream request.
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl From<rusqlite::Error> for AgentError {
  fn from(e: rusqlite::Error) -> Self {
    AgentError::Storage(e.to_string())
  }
}

impl From<reqwest::Error> for AgentError {
  fn from(e: reqwest::Error) -> Self {
    AgentError::Network(e.to_string())
  }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, AgentError>;
