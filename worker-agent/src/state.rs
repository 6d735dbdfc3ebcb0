use std::time::Instant;

use fleet_primitives::NodeStatus;
use tokio::sync::Mutex;

use crate::config::WorkerConfig;
use crate::status;

/// Shared, task-visible agent state: the clock anchors for uptime/idle
/// accounting and the HTTP client reused for every local probe and
/// inference call.
pub struct AgentState {
    pub http: reqwest::Client,
    pub config: WorkerConfig,
    started_at: Instant,
    last_inference: Mutex<Instant>,
}

impl AgentState {
    pub fn new(config: WorkerConfig) -> Self {
        Self { http: reqwest::Client::new(), config, started_at: Instant::now(), last_inference: Mutex::new(Instant::now()) }
    }

    /// Resets the idle clock. Called whenever `/api/ps` shows a loaded
    /// model or a broker-routed inference request is served locally.
    pub async fn mark_inference_activity(&self) {
        *self.last_inference.lock().await = Instant::now();
    }

    async fn idle_seconds(&self) -> u64 {
        self.last_inference.lock().await.elapsed().as_secs()
    }

    pub async fn snapshot(&self) -> NodeStatus {
        let idle_seconds = self.idle_seconds().await;
        let status = status::collect(&self.config, &self.http, self.started_at, idle_seconds).await;
        if status.models.iter().any(|m| m.currently_loaded) {
            self.mark_inference_activity().await;
        }
        status
    }
}
