//! HTTP surface of the broker.
//!
//! Callers enqueue and dispatch commands; the agent polls, posts results and
//! heartbeats. Every handler goes through [`Broker`] operations and never
//! touches relay state directly.

use std::time::Duration;

use axum::body::Bytes;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::{
    broker::Broker,
    protocol::{
        DispatchRequest, EnqueueRequest, EnqueueResponse, HeartbeatRequest, HeartbeatResponse,
        PollQuery, PollResponse, SubmitResultsRequest, SubmitResultsResponse, WaitQuery,
    },
    selector::EndpointStatus,
    transport::{serve_push_agent, TransportMode},
};

#[derive(Clone)]
struct ApiState {
    broker: Broker,
    transport: TransportMode,
    tunnel: Option<watch::Receiver<EndpointStatus>>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn api_router(
    broker: Broker,
    transport: TransportMode,
    tunnel: Option<watch::Receiver<EndpointStatus>>,
) -> axum::Router {
    use axum::{routing, Router};

    let state = ApiState {
        broker,
        transport,
        tunnel,
    };

    let agent = match transport {
        TransportMode::Poll => Router::new().route("/api/poll", routing::get(api_poll)),
        TransportMode::Push => Router::new().route("/api/agent/ws", routing::get(api_agent_ws)),
    };

    Router::new()
        .route("/health", routing::get(api_health))
        .route("/api/commands", routing::post(api_enqueue))
        .route("/api/commands/dispatch", routing::post(api_dispatch))
        .route("/api/results", routing::post(api_submit_results))
        .route("/api/results/{id}", routing::get(api_wait_for_result))
        .route("/api/heartbeat", routing::post(api_heartbeat))
        .route("/api/tunnel", routing::get(api_tunnel))
        .merge(agent)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

async fn api_health(
    axum::extract::State(state): axum::extract::State<ApiState>,
) -> axum::Json<Value> {
    let snapshot = state.broker.health();
    let mut body = serde_json::to_value(&snapshot).unwrap_or_else(|_| json!({}));
    if let Some(fields) = body.as_object_mut() {
        fields.insert("status".into(), json!("ok"));
        fields.insert("service".into(), json!("command-relay"));
        fields.insert("version".into(), json!(env!("CARGO_PKG_VERSION")));
        fields.insert("transport".into(), json!(state.transport));
    }
    axum::Json(body)
}

fn missing_kind() -> (axum::http::StatusCode, axum::Json<Value>) {
    (
        axum::http::StatusCode::BAD_REQUEST,
        axum::Json(json!({ "success": false, "error": "Missing required field: kind" })),
    )
}

async fn api_enqueue(
    axum::extract::State(state): axum::extract::State<ApiState>,
    axum::Json(body): axum::Json<EnqueueRequest>,
) -> (axum::http::StatusCode, axum::Json<Value>) {
    let kind = body.kind.trim();
    if kind.is_empty() {
        return missing_kind();
    }

    let command_id = state.broker.enqueue(kind, body.payload);
    (
        axum::http::StatusCode::OK,
        axum::Json(json!(EnqueueResponse { command_id })),
    )
}

async fn api_dispatch(
    axum::extract::State(state): axum::extract::State<ApiState>,
    axum::Json(body): axum::Json<DispatchRequest>,
) -> (axum::http::StatusCode, axum::Json<Value>) {
    let kind = body.kind.trim();
    if kind.is_empty() {
        return missing_kind();
    }

    let timeout = body
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.broker.settings().result_timeout);
    let result = state
        .broker
        .enqueue_and_wait(kind, body.payload, timeout)
        .await;
    (axum::http::StatusCode::OK, axum::Json(json!(result)))
}

async fn api_wait_for_result(
    axum::extract::State(state): axum::extract::State<ApiState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    axum::extract::Query(query): axum::extract::Query<WaitQuery>,
) -> axum::Json<Value> {
    let timeout = query
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.broker.settings().result_timeout);
    let result = state.broker.wait_for_result(&id, timeout).await;
    axum::Json(json!(result))
}

async fn api_poll(
    axum::extract::State(state): axum::extract::State<ApiState>,
    axum::extract::Query(query): axum::extract::Query<PollQuery>,
) -> axum::Json<PollResponse> {
    let commands = state.broker.drain(query.max_batch);
    axum::Json(PollResponse { commands })
}

async fn api_submit_results(
    axum::extract::State(state): axum::extract::State<ApiState>,
    axum::Json(body): axum::Json<SubmitResultsRequest>,
) -> axum::Json<SubmitResultsResponse> {
    let outcome = state.broker.submit_results(body.results);
    axum::Json(SubmitResultsResponse {
        accepted_count: outcome.accepted,
    })
}

async fn api_heartbeat(
    axum::extract::State(state): axum::extract::State<ApiState>,
    body: Bytes,
) -> axum::Json<HeartbeatResponse> {
    // The body is informational; an empty or odd one still counts.
    let request = serde_json::from_slice::<HeartbeatRequest>(&body).unwrap_or_default();
    state.broker.record_heartbeat();
    tracing::trace!(
        target = "command_relay::api",
        agent_timestamp = ?request.timestamp,
        "agent heartbeat"
    );
    axum::Json(HeartbeatResponse { accepted: true })
}

async fn api_tunnel(
    axum::extract::State(state): axum::extract::State<ApiState>,
) -> axum::Json<Value> {
    let Some(tunnel) = state.tunnel else {
        return axum::Json(json!({ "state": "disabled", "baseUrl": null }));
    };

    let status = tunnel.borrow().clone();
    let mut body = serde_json::to_value(&status).unwrap_or_else(|_| json!({}));
    if let Some(fields) = body.as_object_mut() {
        fields.insert("baseUrl".into(), json!(status.base_url()));
    }
    axum::Json(body)
}

async fn api_agent_ws(
    ws: axum::extract::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<ApiState>,
) -> impl axum::response::IntoResponse {
    let broker = state.broker.clone();
    ws.on_upgrade(move |socket| serve_push_agent(socket, broker))
}
