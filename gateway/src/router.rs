//! Backend selection (§4.1's routing modes).

use crate::backend::WorkerState;
use crate::config::RoutingMode;
use crate::state::{BackendId, GatewayState};

/// Resolves a routing mode (request override, or the gateway's configured
/// default) to the backend that should serve the request. `auto` consults
/// the local backend's current state and, if a fleet client is configured,
/// the fleet's healthy-remote-worker count.
pub async fn select_backend(state: &GatewayState, mode: RoutingMode) -> BackendId {
    match mode {
        RoutingMode::Local => BackendId::Local,
        RoutingMode::Remote => BackendId::Remote,
        RoutingMode::Mac => BackendId::Mac,
        // Broker mode never reaches backend selection; the proxy handler
        // branches to the broker publish path before calling this.
        RoutingMode::Broker => BackendId::Remote,
        RoutingMode::Auto => select_auto(state).await,
    }
}

async fn select_auto(state: &GatewayState) -> BackendId {
    // 1. Local already running -> route locally.
    if state.local.state() == WorkerState::Running {
        return BackendId::Local;
    }

    // 2. Fleet has a healthy remote worker -> route remote.
    if let Some(fleet) = &state.fleet_client {
        if fleet.has_healthy_remote_worker().await {
            if let Some(best) = fleet.best_remote_worker().await {
                if let Some(ip) = best.nebula_ip.or(best.public_ip) {
                    state.remote.set_base_url(Some(format!("http://{ip}:11434")));
                }
            }
            return BackendId::Remote;
        }
    } else if state.remote.state() == WorkerState::Running {
        return BackendId::Remote;
    }

    // 3. Neither is up: prefer cold-starting local if it's configured,
    //    otherwise cold-start remote.
    if state.local.base_url().is_some() {
        BackendId::Local
    } else {
        BackendId::Remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::provision::NullProvisioner;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(ollama: Option<&str>, remote: Option<&str>) -> GatewayConfig {
        GatewayConfig {
            listen_addr: "0.0.0.0:8080".parse().unwrap(),
            metrics_addr: "0.0.0.0:9090".parse().unwrap(),
            ollama_url: ollama.map(str::to_string),
            remote_ollama_url: remote.map(str::to_string),
            idle_timeout: Duration::from_secs(2400),
            warmup_timeout: Duration::from_secs(300),
            broker_mode: false,
            rabbitmq_url: None,
            fleet_api_url: None,
            routing_mode: RoutingMode::Auto,
        }
    }

    #[tokio::test]
    async fn auto_routes_local_when_local_running() {
        let state = GatewayState::new(config(Some("http://local:11434"), Some("http://remote:11434")), Arc::new(NullProvisioner));
        let _ = state.local.begin_cold_start();
        state.local.mark_running();
        assert_eq!(select_backend(&state, RoutingMode::Auto).await, BackendId::Local);
    }

    #[tokio::test]
    async fn auto_prefers_local_cold_start_when_nothing_is_up() {
        let state = GatewayState::new(config(Some("http://local:11434"), Some("http://remote:11434")), Arc::new(NullProvisioner));
        assert_eq!(select_backend(&state, RoutingMode::Auto).await, BackendId::Local);
    }

    #[tokio::test]
    async fn auto_falls_back_to_remote_cold_start_without_local_url() {
        let state = GatewayState::new(config(None, Some("http://remote:11434")), Arc::new(NullProvisioner));
        assert_eq!(select_backend(&state, RoutingMode::Auto).await, BackendId::Remote);
    }

    #[tokio::test]
    async fn forced_remote_mode_ignores_local_state() {
        let state = GatewayState::new(config(Some("http://local:11434"), Some("http://remote:11434")), Arc::new(NullProvisioner));
        let _ = state.local.begin_cold_start();
        state.local.mark_running();
        assert_eq!(select_backend(&state, RoutingMode::Remote).await, BackendId::Remote);
    }
}
