//! Idle watcher: the background scale-to-zero ticker described in §4.1.
//! Every `TICK_INTERVAL`, each backend with an elapsed idle time past the
//! configured TTL is torn down: `running -> stopping`, terminate capability
//! invoked, `stopping -> stopped`. A paused scaler (`/_/pause`) skips a
//! backend entirely.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::backend::{Backend, ScalerMode};
use crate::metrics;
use crate::state::GatewayState;

const TICK_INTERVAL: Duration = Duration::from_secs(10);

pub async fn run(state: Arc<GatewayState>) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    loop {
        ticker.tick().await;
        for backend in [&state.local, &state.remote, &state.mac] {
            tick_one(&state, backend).await;
        }
    }
}

async fn tick_one(state: &GatewayState, backend: &Backend) {
    metrics::IDLE_SECONDS.with_label_values(&[&backend.name]).set(backend.idle_seconds() as f64);
    metrics::set_worker_state(&backend.name, crate::backend::ALL_STATES, &backend.state().to_string());

    if backend.scaler_mode() == ScalerMode::Paused {
        return;
    }

    let ttl = state.idle_timeout().await;
    if backend.idle_seconds() < ttl.as_secs() as i64 {
        return;
    }

    if !backend.begin_teardown() {
        return;
    }

    info!(backend = %backend.name, idle_seconds = backend.idle_seconds(), "idle timeout exceeded, tearing down");
    if let Err(err) = state.provisioner.terminate(&backend.name, "idle_timeout").await {
        warn!(backend = %backend.name, error = %err, "terminate capability failed, backend marked stopped anyway");
    }
    backend.finish_teardown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, RoutingMode};
    use crate::provision::NullProvisioner;

    fn config() -> GatewayConfig {
        GatewayConfig {
            listen_addr: "0.0.0.0:8080".parse().unwrap(),
            metrics_addr: "0.0.0.0:9090".parse().unwrap(),
            ollama_url: Some("http://local:11434".to_string()),
            remote_ollama_url: None,
            idle_timeout: Duration::from_secs(0),
            warmup_timeout: Duration::from_secs(300),
            broker_mode: false,
            rabbitmq_url: None,
            fleet_api_url: None,
            routing_mode: RoutingMode::Auto,
        }
    }

    #[tokio::test]
    async fn idle_backend_past_ttl_tears_down() {
        let state = Arc::new(GatewayState::new(config(), Arc::new(NullProvisioner)));
        tick_one(&state, &state.local).await;
        assert_eq!(state.local.state(), crate::backend::WorkerState::Stopped);
    }

    #[tokio::test]
    async fn paused_backend_is_never_torn_down() {
        let state = Arc::new(GatewayState::new(config(), Arc::new(NullProvisioner)));
        state.local.pause();
        tick_one(&state, &state.local).await;
        assert_eq!(state.local.state(), crate::backend::WorkerState::Running);
    }
}
