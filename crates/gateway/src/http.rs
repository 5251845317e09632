//! HTTP surface: the SSE endpoint plus health, readiness, and
//! metrics.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::json;
use tracing::warn;

use crate::broadcast::BroadcastManager;
use crate::metrics::GatewayMetrics;
use crate::state::{RedisStateReader, StateReader};
use crate::stream::{job_stream, StreamEvent, StreamSettings};

pub struct AppState {
    pub manager: BroadcastManager,
    pub reader: Arc<RedisStateReader>,
    pub metrics: GatewayMetrics,
    pub registry: Registry,
    pub settings: StreamSettings,
    pub min_job_id_len: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/stream/{job_id}", get(subscribe))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn subscribe(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<serde_json::Value>)>
{
    if job_id.len() < state.min_job_id_len {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid job_id" })),
        ));
    }

    let reader: Arc<dyn StateReader> = state.reader.clone();
    let events = job_stream(
        state.manager.clone(),
        reader,
        state.metrics.clone(),
        state.settings,
        job_id,
    )
    .map(|event| Ok(encode(event)));

    Ok(Sse::new(events))
}

fn encode(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Stage(envelope) => {
            // Event name is the stage itself, so EventSource clients
            // can addEventListener per stage.
            let name = envelope.stage.as_str();
            let data = serde_json::to_string(&envelope).unwrap_or_default();
            Event::default().event(name).data(data)
        }
        StreamEvent::Keepalive => Event::default().event("keepalive").data("{}"),
        StreamEvent::Error { error, message } => {
            let data = json!({ "type": "error", "error": error, "message": message });
            Event::default().event("error").data(data.to_string())
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Err(e) = state.reader.ping().await {
        warn!(error = %e, "readiness ping failed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "reason": "redis unreachable" })),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "rooms": state.manager.room_count(),
            "subscribers": state.manager.subscriber_count(),
        })),
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
