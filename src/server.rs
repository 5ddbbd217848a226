//! Local HTTP front.
//!
//! The application is pointed at this server instead of its origin. Every
//! request outside `/__fieldcache/` is rewritten onto the upstream origin and
//! handed to the agent; the control routes carry client messages.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::agent::messenger::{ClientMessage, ControlMessage};
use crate::agent::request::AgentRequest;
use crate::agent::sync::SyncResult;
use crate::agent::Agent;
use crate::cache::ResponseSnapshot;
use crate::event::{AgentEvent, EventOutcome};
use crate::network::is_hop_by_hop;

/// Largest request body accepted from the application.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct ServerState {
  agent: Arc<Agent>,
  upstream: Url,
}

pub fn router(agent: Arc<Agent>, upstream: Url) -> Router {
  let state = ServerState { agent, upstream };

  Router::new()
    .route("/__fieldcache/message", post(control_message))
    .route("/__fieldcache/sync", post(trigger_sync))
    .route("/__fieldcache/events", get(client_events))
    .route("/__fieldcache/status", get(status))
    .fallback(intercept)
    .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn serve(agent: Arc<Agent>, upstream: Url, addr: SocketAddr) -> color_eyre::Result<()> {
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .map_err(|e| color_eyre::eyre::eyre!("Failed to bind to {}: {}", addr, e))?;
  info!(%addr, %upstream, "Listening");

  axum::serve(listener, router(agent, upstream))
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
      info!("Shutting down");
    })
    .await?;
  Ok(())
}

/// Every request that is not a control route.
async fn intercept(State(state): State<ServerState>, req: Request) -> Response {
  let agent_req = match to_agent_request(&state.upstream, req).await {
    Ok(r) => r,
    Err(message) => {
      return (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "BadRequest", "message": message})),
      )
        .into_response()
    }
  };

  match state.agent.fetch(agent_req).await {
    Ok(snapshot) => to_response(snapshot),
    Err(e) => {
      warn!(error = %e, "Request could not be satisfied");
      (
        StatusCode::BAD_GATEWAY,
        Json(json!({"error": "BadGateway", "message": e.to_string()})),
      )
        .into_response()
    }
  }
}

async fn to_agent_request(upstream: &Url, req: Request) -> Result<AgentRequest, String> {
  let (parts, body) = req.into_parts();
  // Only path and query are taken from the client; the origin is always ours
  let mut url = upstream.clone();
  url.set_path(parts.uri.path());
  url.set_query(parts.uri.query());

  let mut agent_req = AgentRequest::new(parts.method, url);
  agent_req.headers = header_pairs(&parts.headers);

  let bytes = to_bytes(body, MAX_BODY_BYTES)
    .await
    .map_err(|e| format!("Failed to read request body: {}", e))?;
  if !bytes.is_empty() {
    agent_req.body = Some(bytes.to_vec());
  }

  Ok(agent_req.with_fetch_metadata())
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect()
}

fn to_response(snapshot: ResponseSnapshot) -> Response {
  let mut builder = axum::http::Response::builder().status(snapshot.status);
  for (name, value) in &snapshot.headers {
    if !is_hop_by_hop(name) {
      builder = builder.header(name.as_str(), value.as_str());
    }
  }

  builder.body(Body::from(snapshot.body)).unwrap_or_else(|e| {
    warn!(error = %e, "Unrepresentable response");
    StatusCode::BAD_GATEWAY.into_response()
  })
}

/// POST /__fieldcache/message - SKIP_WAITING or CLEAR_CACHE.
async fn control_message(
  State(state): State<ServerState>,
  Json(msg): Json<ControlMessage>,
) -> Response {
  debug!(?msg, "Control message");
  let (tx, rx) = oneshot::channel();

  if let Err(e) = state.agent.dispatch(AgentEvent::Message(msg, Some(tx))).await {
    return (
      StatusCode::INTERNAL_SERVER_ERROR,
      Json(json!({"error": "ControlFailed", "message": e.to_string()})),
    )
      .into_response();
  }

  match rx.await {
    Ok(reply) => Json(reply).into_response(),
    Err(_) => Json(json!({
      "type": "ACK",
      "state": state.agent.lifecycle_state(),
    }))
    .into_response(),
  }
}

#[derive(Debug, Default, Deserialize)]
struct SyncRequest {
  tag: Option<String>,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
  tag: String,
  result: Option<SyncResult>,
}

/// POST /__fieldcache/sync - explicit sync trigger.
async fn trigger_sync(State(state): State<ServerState>, body: axum::body::Bytes) -> Response {
  let request: SyncRequest = if body.is_empty() {
    SyncRequest::default()
  } else {
    match serde_json::from_slice(&body) {
      Ok(r) => r,
      Err(e) => {
        return (
          StatusCode::BAD_REQUEST,
          Json(json!({"error": "BadRequest", "message": e.to_string()})),
        )
          .into_response()
      }
    }
  };
  let tag = request
    .tag
    .unwrap_or_else(|| state.agent.sync_tag().to_string());

  match state.agent.dispatch(AgentEvent::Sync(tag.clone())).await {
    Ok(EventOutcome::Synced(result)) => Json(SyncResponse { tag, result }).into_response(),
    Ok(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    Err(e) => (
      StatusCode::INTERNAL_SERVER_ERROR,
      Json(json!({"error": "SyncFailed", "message": e.to_string()})),
    )
      .into_response(),
  }
}

/// GET /__fieldcache/events - client messages as server-sent events.
async fn client_events(
  State(state): State<ServerState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
  let rx = state.agent.messenger().subscribe();

  let stream = futures::stream::unfold(rx, |mut rx| async move {
    loop {
      match rx.recv().await {
        Ok(msg) => {
          let event = client_event(&msg);
          return Some((Ok::<_, Infallible>(event), rx));
        }
        Err(broadcast::error::RecvError::Lagged(missed)) => {
          warn!(missed, "Client fell behind, skipping messages");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  });

  Sse::new(stream).keep_alive(KeepAlive::default())
}

fn client_event(msg: &ClientMessage) -> Event {
  Event::default()
    .json_data(msg)
    .unwrap_or_else(|_| Event::default().comment("unserializable message"))
}

/// GET /__fieldcache/status
async fn status(State(state): State<ServerState>) -> Response {
  match state.agent.status().await {
    Ok(status) => Json(status).into_response(),
    Err(e) => (
      StatusCode::INTERNAL_SERVER_ERROR,
      Json(json!({"error": "StatusUnavailable", "message": e.to_string()})),
    )
      .into_response(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::agent::AgentSettings;
  use crate::cache::{MemoryStorage, PartitionSet};
  use crate::config::{DocumentsConfig, RoutingConfig, SyncConfig};
  use crate::network::testing::MockNetwork;
  use tower::ServiceExt;

  async fn setup() -> (Router, Arc<MockNetwork>) {
    let network = Arc::new(MockNetwork::new());
    network.route(
      "GET",
      "http://app.local/index.html",
      ResponseSnapshot::new(200, vec![], "<html>shell</html>"),
    );
    let settings = AgentSettings {
      partitions: PartitionSet::for_version("v1"),
      origin: Url::parse("http://app.local/").unwrap(),
      routing: RoutingConfig::default(),
      documents: DocumentsConfig::default(),
      precache: vec!["/index.html".into()],
      sync: SyncConfig::default(),
    };
    let agent = Arc::new(Agent::new(
      settings,
      Arc::new(MemoryStorage::new()),
      network.clone(),
      None,
    ));
    agent.start().await.unwrap();
    (
      router(agent, Url::parse("http://app.local/").unwrap()),
      network,
    )
  }

  async fn body_json(response: Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
  }

  #[tokio::test]
  async fn test_offline_post_through_http_front() {
    let (app, network) = setup().await;
    network.set_offline(true);

    let response = app
      .oneshot(
        axum::http::Request::post("/api/organizations")
          .header("content-type", "application/json")
          .body(Body::from(r#"{"name":"Acme"}"#))
          .unwrap(),
      )
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(response).await["queued"], true);
  }

  #[tokio::test]
  async fn test_request_is_rewritten_onto_upstream() {
    let (app, network) = setup().await;
    network.route(
      "GET",
      "http://app.local/api/standards?family=ams",
      ResponseSnapshot::new(
        200,
        vec![("content-type".into(), "application/json".into())],
        "[]",
      ),
    );

    let response = app
      .oneshot(
        axum::http::Request::get("/api/standards?family=ams")
          .body(Body::empty())
          .unwrap(),
      )
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
      response.headers().get("content-type").unwrap(),
      "application/json"
    );
    let last = network.calls().pop().unwrap();
    assert_eq!(last.url.as_str(), "http://app.local/api/standards?family=ams");
  }

  #[tokio::test]
  async fn test_scheme_relative_path_stays_on_upstream() {
    let (app, network) = setup().await;

    app
      .oneshot(
        axum::http::Request::get("//evil.example/api/standards")
          .body(Body::empty())
          .unwrap(),
      )
      .await
      .unwrap();

    let last = network.calls().pop().unwrap();
    assert_eq!(last.url.host_str(), Some("app.local"));
    assert_eq!(last.url.path(), "//evil.example/api/standards");
    assert!(network
      .calls()
      .iter()
      .all(|req| req.url.host_str() == Some("app.local")));
  }

  #[tokio::test]
  async fn test_unsatisfiable_request_is_bad_gateway() {
    let (app, network) = setup().await;
    network.set_offline(true);

    let response = app
      .oneshot(axum::http::Request::get("/assets/app.js").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
  }

  #[tokio::test]
  async fn test_clear_cache_message_replies() {
    let (app, _network) = setup().await;

    let response = app
      .oneshot(
        axum::http::Request::post("/__fieldcache/message")
          .header("content-type", "application/json")
          .body(Body::from(r#"{"type":"CLEAR_CACHE"}"#))
          .unwrap(),
      )
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["type"], "CACHE_CLEARED");
    assert_eq!(json["success"], true);
  }

  #[tokio::test]
  async fn test_sync_route_defaults_to_configured_tag() {
    let (app, _network) = setup().await;

    let response = app
      .oneshot(
        axum::http::Request::post("/__fieldcache/sync")
          .body(Body::empty())
          .unwrap(),
      )
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["tag"], "sync-queue");
    assert_eq!(json["result"]["successful"], 0);
    assert_eq!(json["result"]["failed"], 0);
  }

  #[tokio::test]
  async fn test_status_route() {
    let (app, _network) = setup().await;
    let response = app
      .oneshot(
        axum::http::Request::get("/__fieldcache/status")
          .body(Body::empty())
          .unwrap(),
      )
      .await
      .unwrap();

    let json = body_json(response).await;
    assert_eq!(json["lifecycle"], "activated");
    assert_eq!(json["queued"], 0);
  }
}
