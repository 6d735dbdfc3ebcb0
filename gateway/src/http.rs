//! HTTP surface: the admin control routes of §4.1 (`/_/...`), health
//! checks, the proxy catch-all, and the metrics listener on its own port.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::backend::ALL_STATES;
use crate::error::AdminError;
use crate::metrics;
use crate::proxy;
use crate::state::{BackendId, GatewayState};

fn parse_backend(name: &str) -> Result<BackendId, AdminError> {
    match name {
        "local" => Ok(BackendId::Local),
        "remote" => Ok(BackendId::Remote),
        "mac" => Ok(BackendId::Mac),
        other => Err(AdminError::UnknownBackend(other.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct BackendQuery {
    backend: Option<String>,
}

async fn status(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let backend_status = |b: &crate::backend::Backend| {
        json!({
            "state": b.state().to_string(),
            "base_url": b.base_url(),
            "idle_seconds": b.idle_seconds(),
            "scaler_mode": b.scaler_mode(),
            "requests_total": b.requests_total(),
            "requests_blocked": b.requests_blocked(),
            "cold_starts": b.cold_starts(),
        })
    };
    Json(json!({
        "instance_id": state.instance_id,
        "routing_mode": state.default_routing_mode().to_string(),
        "idle_timeout_seconds": state.idle_timeout().await.as_secs(),
        "local": backend_status(&state.local),
        "remote": backend_status(&state.remote),
        "mac": backend_status(&state.mac),
    }))
}

async fn start(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<BackendQuery>,
) -> Result<impl IntoResponse, AdminError> {
    let id = parse_backend(query.backend.as_deref().unwrap_or("local"))?;
    let state = state.clone();
    tokio::spawn(async move {
        let _ = proxy::ensure_warm(&state, id).await;
    });
    Ok(Json(json!({ "started": id.as_str() })))
}

async fn stop(State(state): State<Arc<GatewayState>>, Query(query): Query<BackendQuery>) -> Result<impl IntoResponse, AdminError> {
    let id = parse_backend(query.backend.as_deref().unwrap_or("local"))?;
    let backend = state.backend(id);
    if backend.begin_teardown() {
        let _ = state.provisioner.terminate(&backend.name, "admin_stop").await;
        backend.finish_teardown();
    }
    Ok(Json(json!({ "stopped": id.as_str() })))
}

async fn pause(State(state): State<Arc<GatewayState>>, Query(query): Query<BackendQuery>) -> Result<impl IntoResponse, AdminError> {
    let id = parse_backend(query.backend.as_deref().unwrap_or("local"))?;
    state.backend(id).pause();
    Ok(Json(json!({ "paused": id.as_str() })))
}

async fn resume(State(state): State<Arc<GatewayState>>, Query(query): Query<BackendQuery>) -> Result<impl IntoResponse, AdminError> {
    let id = parse_backend(query.backend.as_deref().unwrap_or("local"))?;
    state.backend(id).resume();
    Ok(Json(json!({ "resumed": id.as_str() })))
}

#[derive(Debug, Deserialize)]
struct TtlQuery {
    ttl: String,
}

async fn set_ttl(State(state): State<Arc<GatewayState>>, Query(query): Query<TtlQuery>) -> Result<impl IntoResponse, AdminError> {
    let duration = humantime::parse_duration(&query.ttl)?;
    state.set_idle_timeout(duration).await;
    Ok(Json(json!({ "idle_timeout_seconds": duration.as_secs() })))
}

async fn health() -> impl IntoResponse {
    axum::http::StatusCode::OK
}

async fn ready(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let _ = state.idle_timeout().await;
    axum::http::StatusCode::OK
}

async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    for backend in [&state.local, &state.remote, &state.mac] {
        metrics::IDLE_SECONDS.with_label_values(&[&backend.name]).set(backend.idle_seconds() as f64);
        metrics::set_worker_state(&backend.name, ALL_STATES, &backend.state().to_string());
    }
    (axum::http::StatusCode::OK, [("content-type", "text/plain; version=0.0.4")], metrics::encode())
}

/// Client-facing router: admin control routes plus the reverse-proxy
/// catch-all. Bound to `listen_addr`.
pub fn client_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/_/status", get(status))
        .route("/_/start", post(start))
        .route("/_/stop", post(stop))
        .route("/_/pause", post(pause))
        .route("/_/resume", post(resume))
        .route("/_/ttl", post(set_ttl))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .fallback(proxy::handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Metrics-only router, bound to `metrics_addr` (§6: served on a separate
/// port from client traffic).
pub fn metrics_router(state: Arc<GatewayState>) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).with_state(state)
}
