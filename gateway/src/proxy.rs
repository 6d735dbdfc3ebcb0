//! Reverse proxy: cold-start barrier orchestration, request forwarding,
//! and the failure semantics of §4.1/§7.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use fleet_primitives::{InferenceRequest, Priority};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BarrierOutcome, ColdStartAttempt, WorkerState};
use crate::broker;
use crate::config::RoutingMode;
use crate::error::ProxyError;
use crate::metrics;
use crate::router;
use crate::state::{BackendId, GatewayState};

const PROBE_PATH: &str = "/api/tags";
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Ensures `backend` is warm, cold-starting it if necessary and blocking
/// the caller on the single-flight barrier. Never called for a
/// `RoutingMode::Broker` request.
pub async fn ensure_warm(state: &Arc<GatewayState>, id: BackendId) -> Result<(), ProxyError> {
    let backend = state.backend(id);
    match backend.begin_cold_start() {
        ColdStartAttempt::AlreadyRunning => Ok(()),
        ColdStartAttempt::Unavailable => Err(ProxyError::BackendUnavailable(format!("{} is stopping", id.as_str()))),
        ColdStartAttempt::Initiate(rx) => {
            spawn_warmup(state.clone(), id);
            await_barrier(backend, rx, state.config.warmup_timeout, id).await
        }
        ColdStartAttempt::Join(rx) => await_barrier(backend, rx, state.config.warmup_timeout, id).await,
    }
}

async fn await_barrier(
    backend: &Backend,
    mut rx: tokio::sync::broadcast::Receiver<BarrierOutcome>,
    warmup_timeout: Duration,
    id: BackendId,
) -> Result<(), ProxyError> {
    backend.record_blocked();
    metrics::REQUESTS_BLOCKED.with_label_values(&[id.as_str()]).inc();
    match tokio::time::timeout(warmup_timeout, rx.recv()).await {
        Ok(Ok(BarrierOutcome::Ready)) => Ok(()),
        Ok(Ok(BarrierOutcome::Failed)) => Err(ProxyError::ProvisionFailed(id.as_str().to_string())),
        Ok(Err(_)) => Err(ProxyError::BackendUnavailable("barrier closed unexpectedly".to_string())),
        Err(_) => Err(ProxyError::ColdStartTimeout),
    }
}

/// The single background task per cold start: invoke the provisioning
/// capability, then poll the readiness probe until it succeeds. Bounded by
/// the caller's own per-wait timeout, not this task's lifetime — per §8,
/// "the barrier is retained; other waiters continue until their own
/// timeouts."
fn spawn_warmup(state: Arc<GatewayState>, id: BackendId) {
    tokio::spawn(async move {
        let backend = state.backend(id);
        if let Err(err) = state.provisioner.provision(id.as_str()).await {
            warn!(backend = id.as_str(), error = %err, "provisioning capability failed, reverting to stopped");
            backend.fail_cold_start();
            return;
        }

        loop {
            let Some(base_url) = backend.base_url() else {
                // Provisioning succeeded but no URL is known yet (e.g. the
                // fleet hasn't reported an IP for this worker). Keep
                // polling; the fleet client may populate it shortly.
                tokio::time::sleep(PROBE_INTERVAL).await;
                continue;
            };
            if probe_ready(&state.http_client, &base_url).await {
                info!(backend = id.as_str(), %base_url, "backend warm");
                backend.mark_running();
                return;
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    });
}

/// Broker-mediated inference (§4.2): parse the client's JSON body into an
/// `InferenceRequest`, publish it per the priority-bucket routing rules, and
/// await the correlated reply. Requires the gateway to have been started
/// with `broker_mode` enabled.
async fn handle_broker(state: &Arc<GatewayState>, body: Body) -> Result<Response, ProxyError> {
    let (conn, reply_queue) = match (&state.broker_conn, &state.reply_queue) {
        (Some(conn), Some(queue)) => (conn, queue),
        _ => return Err(ProxyError::BackendUnavailable("broker mode is not configured".to_string())),
    };

    let bytes = axum::body::to_bytes(body, 1024 * 1024)
        .await
        .map_err(|err| ProxyError::BackendUnavailable(err.to_string()))?;
    let payload: InferencePayload =
        serde_json::from_slice(&bytes).map_err(|err| ProxyError::BackendUnavailable(format!("invalid request body: {err}")))?;
    let priority = Priority::new(payload.priority).map_err(|err| ProxyError::BackendUnavailable(err.to_string()))?;

    let request = InferenceRequest {
        id: Uuid::new_v4().to_string(),
        model: payload.model,
        prompt: payload.prompt,
        stream: payload.stream,
        options: payload.options,
        priority,
        reply_to: reply_queue.clone(),
        timestamp: Utc::now(),
        headers: std::collections::HashMap::new(),
    };

    let response = broker::publish_and_await(conn, &state.reply_correlator, reply_queue, request, state.config.warmup_timeout).await?;
    Ok(Json(response).into_response())
}

async fn probe_ready(client: &reqwest::Client, base_url: &str) -> bool {
    let url = format!("{}{}", base_url.trim_end_matches('/'), PROBE_PATH);
    match tokio::time::timeout(PROBE_TIMEOUT, client.get(&url).send()).await {
        Ok(Ok(resp)) => resp.status().is_success(),
        _ => false,
    }
}

pub async fn handle(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    match handle_inner(state, method, uri, headers, body).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct InferencePayload {
    model: String,
    prompt: String,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    options: std::collections::HashMap<String, serde_json::Value>,
    #[serde(default)]
    priority: u8,
}

async fn handle_inner(
    state: Arc<GatewayState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ProxyError> {
    let mode = state.default_routing_mode();

    if mode == RoutingMode::Broker {
        return handle_broker(&state, body).await;
    }

    let id = router::select_backend(&state, mode).await;
    state.counters.record(id);

    ensure_warm(&state, id).await?;

    let backend = state.backend(id);
    let base_url = backend
        .base_url()
        .ok_or_else(|| ProxyError::NoBackend(id.as_str().to_string()))?;

    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let target = format!("{}{}", base_url.trim_end_matches('/'), path_and_query);

    let body_bytes = axum::body::to_bytes(body, 64 * 1024 * 1024)
        .await
        .map_err(|err| ProxyError::BackendUnavailable(err.to_string()))?;

    let mut outbound = state.http_client.request(method, &target);
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST {
            continue;
        }
        outbound = outbound.header(name, value);
    }
    outbound = outbound.body(body_bytes);

    let upstream = match outbound.send().await {
        Ok(resp) => resp,
        Err(err) if err.is_connect() && backend.state() == WorkerState::Running => {
            warn!(backend = id.as_str(), "backend connection refused while running, demoting to stopped");
            backend.demote_to_stopped();
            return Err(ProxyError::BackendUnavailable(format!("{} connection refused", id.as_str())));
        }
        Err(err) => return Err(ProxyError::Upstream(err)),
    };

    backend.touch_last_request(Utc::now());
    backend.record_request();
    metrics::REQUESTS_TOTAL.with_label_values(&[id.as_str()]).inc();

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers().iter() {
        response_headers.insert(name.clone(), value.clone());
    }

    let stream = upstream.bytes_stream();
    let mut builder = Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        *h = response_headers;
    }
    // 5xx responses are passed through verbatim, never retried — inference
    // is non-idempotent (§4.1's failure semantics).
    Ok(builder.body(Body::from_stream(stream)).unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_ready_is_false_on_connection_refused() {
        let client = reqwest::Client::new();
        assert!(!probe_ready(&client, "http://127.0.0.1:1").await);
    }
}
