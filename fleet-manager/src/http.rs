use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use fleet_primitives::{HealthStatus, NodeType};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::metrics;
use crate::registry::{ListFilter, Registry};

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<Registry>,
}

#[derive(Debug, Deserialize, Default)]
pub struct FleetQuery {
    node_type: Option<String>,
    health: Option<String>,
}

impl FleetQuery {
    fn into_filter(self) -> ListFilter {
        ListFilter {
            node_type: self.node_type.and_then(|s| s.parse::<NodeType>().ok()),
            health: self.health.and_then(|s| parse_health(&s)),
        }
    }
}

fn parse_health(s: &str) -> Option<HealthStatus> {
    use HealthStatus::*;
    Some(match s {
        "healthy" => Healthy,
        "degraded" => Degraded,
        "unhealthy" => Unhealthy,
        "stale" => Stale,
        "dead" => Dead,
        _ => return None,
    })
}

async fn list_nodes(State(state): State<AdminState>, Query(query): Query<FleetQuery>) -> impl IntoResponse {
    let filter = query.into_filter();
    Json(state.registry.list_nodes(&filter))
}

async fn fleet_status(State(state): State<AdminState>, Query(query): Query<FleetQuery>) -> impl IntoResponse {
    let filter = query.into_filter();
    let status = state.registry.fleet_status(&filter);
    metrics::observe_fleet(&state.registry);
    Json(status)
}

async fn get_node(
    State(state): State<AdminState>,
    axum::extract::Path(node_id): axum::extract::Path<String>,
) -> impl IntoResponse {
    match state.registry.get_node(&node_id) {
        Some(node) => Json(node).into_response(),
        None => crate::error::RegistryError::NotFound(node_id).into_response(),
    }
}

async fn health() -> impl IntoResponse {
    axum::http::StatusCode::OK
}

async fn ready(State(state): State<AdminState>) -> impl IntoResponse {
    let _ = state.registry.connected_count();
    axum::http::StatusCode::OK
}

async fn metrics_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, [("content-type", "text/plain; version=0.0.4")], metrics::encode())
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/nodes", get(list_nodes))
        .route("/nodes/:node_id", get(get_node))
        .route("/fleet/status", get(fleet_status))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
