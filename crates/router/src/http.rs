//! Health, readiness, and metrics endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::store::RedisEventStore;

pub struct AppState {
    pub store: Arc<RedisEventStore>,
    pub registry: Registry,
    /// Consumer and reclaimer handles, probed for liveness only.
    pub tasks: Vec<JoinHandle<()>>,
    /// Every stream key the router consumes.
    pub stream_keys: Vec<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Ready iff the store answers PING and no background task has died.
/// The response carries the summed unacked backlog for operators.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Err(e) = state.store.ping().await {
        warn!(error = %e, "readiness ping failed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "reason": "redis unreachable" })),
        );
    }

    if state.tasks.iter().any(|task| task.is_finished()) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "reason": "background task exited" })),
        );
    }

    let mut backlog = 0usize;
    for stream_key in &state.stream_keys {
        match state.store.backlog(stream_key).await {
            Ok(count) => backlog += count,
            Err(e) => warn!(stream = %stream_key, error = %e, "backlog probe failed"),
        }
    }

    (
        StatusCode::OK,
        Json(json!({ "status": "ready", "pending_backlog": backlog })),
    )
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        warn!(error = %e, "metrics encoding failed");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned())
}
