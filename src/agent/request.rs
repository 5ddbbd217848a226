//! Intercepted requests and the responses the agent manufactures itself.

use reqwest::Method;
use serde_json::json;
use url::Url;

use crate::cache::{RequestKey, ResponseSnapshot};

/// What kind of resource the page asked for (`Sec-Fetch-Dest`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Font,
  Empty,
  Other,
}

impl Destination {
  pub fn from_fetch_dest(value: &str) -> Self {
    match value.trim().to_ascii_lowercase().as_str() {
      "document" | "iframe" | "frame" => Destination::Document,
      "image" => Destination::Image,
      "script" | "worker" | "sharedworker" => Destination::Script,
      "style" => Destination::Style,
      "font" => Destination::Font,
      "empty" | "" => Destination::Empty,
      _ => Destination::Other,
    }
  }

  /// Guess from the file extension when the client sent no fetch metadata.
  pub fn from_path(path: &str) -> Self {
    let ext = path
      .rsplit('/')
      .next()
      .and_then(|file| file.rsplit_once('.'))
      .map(|(_, ext)| ext.to_ascii_lowercase());

    match ext.as_deref() {
      Some("png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico" | "avif") => Destination::Image,
      Some("js" | "mjs") => Destination::Script,
      Some("css") => Destination::Style,
      Some("woff" | "woff2" | "ttf" | "otf" | "eot") => Destination::Font,
      _ => Destination::Empty,
    }
  }

  pub fn is_static_asset(self) -> bool {
    matches!(
      self,
      Destination::Image | Destination::Script | Destination::Style | Destination::Font
    )
  }
}

/// Whether the request is a full-document navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  Navigate,
  Other,
}

/// A request intercepted on its way to the origin.
#[derive(Debug, Clone)]
pub struct AgentRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub destination: Destination,
  pub mode: RequestMode,
}

impl AgentRequest {
  pub fn new(method: Method, url: Url) -> Self {
    let destination = Destination::from_path(url.path());
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
      destination,
      mode: RequestMode::Other,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn navigate(mut self) -> Self {
    self.mode = RequestMode::Navigate;
    self.destination = Destination::Document;
    self
  }

  /// Fill in destination and mode from fetch metadata headers, falling back
  /// to the path extension and `Accept: text/html`.
  pub fn with_fetch_metadata(mut self) -> Self {
    if let Some(dest) = self.header("sec-fetch-dest") {
      self.destination = Destination::from_fetch_dest(dest);
    }

    let navigate = match self.header("sec-fetch-mode") {
      Some(mode) => mode.eq_ignore_ascii_case("navigate"),
      None => {
        self.method == Method::GET
          && self
            .header("accept")
            .is_some_and(|accept| accept.contains("text/html"))
      }
    };
    if navigate {
      self = self.navigate();
    }
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Reads are never queued; everything else is a mutation.
  pub fn is_read(&self) -> bool {
    self.method == Method::GET || self.method == Method::HEAD
  }

  /// Only GET responses are ever written to a partition.
  pub fn is_cacheable_method(&self) -> bool {
    self.method == Method::GET
  }

  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }

  pub fn cache_key(&self) -> RequestKey {
    RequestKey::new(self.method.as_str(), self.url.as_str())
  }

  /// Body as text, the form it is kept in the offline queue.
  pub fn body_text(&self) -> Option<String> {
    self
      .body
      .as_ref()
      .map(|b| String::from_utf8_lossy(b).into_owned())
  }
}

/// 202 returned for a mutation that was queued for later replay.
pub fn queued_response() -> ResponseSnapshot {
  ResponseSnapshot::synthetic_json(
    202,
    &json!({
      "queued": true,
      "message": "Request queued for sync when online",
    }),
  )
}

/// 503 returned for a read that can be satisfied neither online nor from cache.
pub fn offline_response() -> ResponseSnapshot {
  ResponseSnapshot::synthetic_json(
    503,
    &json!({
      "error": "Offline",
      "message": "No cached data available",
    }),
  )
}

/// 503 returned when a mutation failed online and could not be queued either.
pub fn queue_unavailable_response(reason: &str) -> ResponseSnapshot {
  ResponseSnapshot::synthetic_json(
    503,
    &json!({
      "queued": false,
      "error": "QueueUnavailable",
      "message": format!("Request could not be queued and may be lost: {}", reason),
    }),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_destination_from_path() {
    assert_eq!(Destination::from_path("/img/logo.PNG"), Destination::Image);
    assert_eq!(Destination::from_path("/assets/app.js"), Destination::Script);
    assert_eq!(Destination::from_path("/assets/app.css"), Destination::Style);
    assert_eq!(Destination::from_path("/fonts/a.woff2"), Destination::Font);
    assert_eq!(Destination::from_path("/api/standards"), Destination::Empty);
    assert_eq!(Destination::from_path("/v1.2/"), Destination::Empty);
  }

  #[test]
  fn test_fetch_metadata_wins_over_extension() {
    let req = AgentRequest::get(url("http://app.local/thumb"))
      .with_header("Sec-Fetch-Dest", "image")
      .with_fetch_metadata();
    assert_eq!(req.destination, Destination::Image);
    assert_eq!(req.mode, RequestMode::Other);
  }

  #[test]
  fn test_navigation_detection() {
    let req = AgentRequest::get(url("http://app.local/inspections"))
      .with_header("Sec-Fetch-Mode", "navigate")
      .with_fetch_metadata();
    assert_eq!(req.mode, RequestMode::Navigate);

    let req = AgentRequest::get(url("http://app.local/inspections"))
      .with_header("Accept", "text/html,application/xhtml+xml")
      .with_fetch_metadata();
    assert_eq!(req.mode, RequestMode::Navigate);

    let req = AgentRequest::get(url("http://app.local/api/x"))
      .with_header("Accept", "application/json")
      .with_fetch_metadata();
    assert_eq!(req.mode, RequestMode::Other);
  }

  #[test]
  fn test_read_and_cacheable_methods() {
    let post = AgentRequest::new(Method::POST, url("http://app.local/api/organizations"));
    assert!(!post.is_read());
    assert!(!post.is_cacheable_method());
    let head = AgentRequest::new(Method::HEAD, url("http://app.local/"));
    assert!(head.is_read());
    assert!(!head.is_cacheable_method());
  }

  #[test]
  fn test_synthetic_bodies() {
    let queued = queued_response();
    assert_eq!(queued.status, 202);
    let body: serde_json::Value = serde_json::from_slice(&queued.body).unwrap();
    assert_eq!(body["queued"], true);

    let offline = offline_response();
    assert_eq!(offline.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&offline.body).unwrap();
    assert_eq!(body["error"], "Offline");

    let lost = queue_unavailable_response("disk full");
    let body: serde_json::Value = serde_json::from_slice(&lost.body).unwrap();
    assert_eq!(body["queued"], false);
    assert_eq!(body["error"], "QueueUnavailable");
  }
}
