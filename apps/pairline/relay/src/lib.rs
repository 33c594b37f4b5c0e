//! Pairline signaling relay.
//!
//! Peers connect over a websocket, register under an id, discover each other
//! with `query`, and exchange offers, answers and candidates addressed by
//! `target`. The relay keeps an in-memory registry only; nothing survives a
//! restart.

use std::future::Future;

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub mod registry;
pub mod relay;
mod websocket;

pub use registry::{ConnectionId, PeerRegistry};
pub use relay::{Connection, Outbound, Relay, RelaySettings, RouteOutcome};

#[derive(Clone)]
pub(crate) struct AppState {
    relay: Relay,
    metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    registered_peers: usize,
    peers: Vec<String>,
}

/// HTTP surface of the relay. The websocket endpoint is served on both `/`
/// and `/ws`.
pub fn router(relay: Relay, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/", get(websocket::ws_handler))
        .route("/ws", get(websocket::ws_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { relay, metrics })
}

pub async fn serve<F>(
    listener: TcpListener,
    relay: Relay,
    metrics: Option<PrometheusHandle>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(relay, metrics))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let peers: Vec<String> = state
        .relay
        .peers()
        .into_iter()
        .map(|id| id.as_str().to_string())
        .collect();
    Json(StatsResponse {
        registered_peers: peers.len(),
        peers,
    })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
