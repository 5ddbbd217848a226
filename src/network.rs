//! Upstream transport.
//!
//! A response with any HTTP status counts as the network answering; only
//! transport failures (refused connection, DNS, timeout) are errors.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::agent::request::AgentRequest;
use crate::cache::ResponseSnapshot;
use crate::error::{AgentError, Result};

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-connection",
  "transfer-encoding",
  "upgrade",
  "te",
  "trailer",
  "host",
  "content-length",
];

pub fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Something that can carry a request to the origin.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, req: &AgentRequest) -> Result<ResponseSnapshot>;
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpNetwork {
  client: Client,
}

impl HttpNetwork {
  pub fn new(timeout: Option<Duration>) -> Result<Self> {
    let mut builder = Client::builder().user_agent(concat!("fieldcache/", env!("CARGO_PKG_VERSION")));
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }
    let client = builder
      .build()
      .map_err(|e| AgentError::Network(format!("Failed to create HTTP client: {}", e)))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, req: &AgentRequest) -> Result<ResponseSnapshot> {
    let mut builder = self.client.request(req.method.clone(), req.url.clone());
    for (name, value) in &req.headers {
      if !is_hop_by_hop(name) {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }
    if let Some(body) = &req.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .map(|(name, value)| {
        (
          name.as_str().to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();
    let body = response.bytes().await?;

    debug!(method = %req.method, url = %req.url, status, "Upstream responded");
    Ok(ResponseSnapshot::new(status, headers, body.to_vec()))
  }
}

#[cfg(test)]
pub mod testing {
  //! Scripted transport for engine tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  #[derive(Default)]
  pub struct MockNetwork {
    offline: AtomicBool,
    routes: Mutex<HashMap<String, ResponseSnapshot>>,
    calls: Mutex<Vec<AgentRequest>>,
  }

  impl MockNetwork {
    pub fn new() -> Self {
      Self::default()
    }

    /// Answer `METHOD URL` with the given response.
    pub fn route(&self, method: &str, url: &str, response: ResponseSnapshot) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(format!("{} {}", method, url), response);
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<AgentRequest> {
      self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.url.as_str() == url)
        .count()
    }
  }

  #[async_trait]
  impl Network for MockNetwork {
    async fn fetch(&self, req: &AgentRequest) -> Result<ResponseSnapshot> {
      self.calls.lock().unwrap().push(req.clone());
      let key = format!("{} {}", req.method, req.url);

      if self.offline.load(Ordering::SeqCst) {
        return Err(AgentError::Network(format!("connection refused: {}", key)));
      }

      let routed = self.routes.lock().unwrap().get(&key).cloned();
      Ok(routed.unwrap_or_else(|| ResponseSnapshot::new(404, vec![], "not found")))
    }
  }
}
