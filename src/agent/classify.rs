//! Traffic classification for intercepted requests.

use super::request::{AgentRequest, RequestMode};
use crate::config::RoutingConfig;

/// Which caching strategy handles a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficClass {
  /// Path under the API prefix
  Api,
  /// Image, script, style or font
  Static,
  /// Full-document navigation
  Navigation,
  /// Everything else over http(s)
  Other,
  /// Not http(s); forwarded without any cache or queue side effects
  Passthrough,
}

/// Assign a request to its traffic class. Earlier rules win.
pub fn classify(req: &AgentRequest, routing: &RoutingConfig) -> TrafficClass {
  if !req.is_http() {
    return TrafficClass::Passthrough;
  }

  if routing.is_api(req.url.path()) {
    TrafficClass::Api
  } else if req.destination.is_static_asset() {
    TrafficClass::Static
  } else if req.mode == RequestMode::Navigate {
    TrafficClass::Navigation
  } else {
    TrafficClass::Other
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::agent::request::Destination;
  use reqwest::Method;
  use url::Url;

  fn req(method: Method, s: &str) -> AgentRequest {
    AgentRequest::new(method, Url::parse(s).unwrap())
  }

  #[test]
  fn test_api_prefix_wins() {
    let routing = RoutingConfig::default();
    let r = req(Method::GET, "http://app.local/api/logo.png");
    assert_eq!(classify(&r, &routing), TrafficClass::Api);
    let r = req(Method::DELETE, "http://app.local/api/organizations/2");
    assert_eq!(classify(&r, &routing), TrafficClass::Api);
  }

  #[test]
  fn test_static_assets() {
    let routing = RoutingConfig::default();
    for path in ["/a.png", "/b.js", "/c.css", "/d.woff2"] {
      let r = req(Method::GET, &format!("http://app.local{}", path));
      assert_eq!(classify(&r, &routing), TrafficClass::Static, "{path}");
    }
  }

  #[test]
  fn test_navigation_and_other() {
    let routing = RoutingConfig::default();
    let r = req(Method::GET, "http://app.local/inspections/new").navigate();
    assert_eq!(classify(&r, &routing), TrafficClass::Navigation);

    let r = req(Method::GET, "http://app.local/manifest.json");
    assert_eq!(classify(&r, &routing), TrafficClass::Other);

    let r = req(Method::GET, "http://app.local/data").with_destination(Destination::Other);
    assert_eq!(classify(&r, &routing), TrafficClass::Other);
  }

  #[test]
  fn test_non_http_schemes_pass_through() {
    let routing = RoutingConfig::default();
    let r = req(Method::GET, "ws://app.local/api/live");
    assert_eq!(classify(&r, &routing), TrafficClass::Passthrough);
    let r = req(Method::GET, "data:text/plain,hello");
    assert_eq!(classify(&r, &routing), TrafficClass::Passthrough);
  }
}
