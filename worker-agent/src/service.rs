use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::executor::Executor;
use crate::state::AgentState;
use crate::{broker, rpc};

/// Composition root: wires up broker registration/heartbeat/inference
/// consumers (when `rabbitmq_url` is configured) and the RPC client, and
/// runs them concurrently until shutdown.
pub struct WorkerAgentService {
    config: WorkerConfig,
    state: Arc<AgentState>,
    broker_conn: Option<Arc<fleet_broker::BrokerConnection>>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerAgentService {
    pub async fn build(config: WorkerConfig) -> anyhow::Result<Self> {
        let state = Arc::new(AgentState::new(config.clone()));
        let executor = Arc::new(Executor::new());

        let mut broker_conn = None;
        let mut tasks = Vec::new();

        if let Some(url) = config.rabbitmq_url.clone() {
            let conn = fleet_broker::BrokerConnection::new(url);
            broker::register(&conn, &config).await?;
            info!(node_id = %config.node_id, "registered with broker");

            tasks.push(tokio::spawn(broker::run_heartbeat_publisher(conn.clone(), config.clone(), state.clone())));
            tasks.push(tokio::spawn(broker::run_inference_consumers(conn.clone(), config.clone(), state.clone())));
            tasks.push(tokio::spawn(broker::run_command_consumer(conn.clone(), config.clone(), state.clone(), executor.clone())));
            broker_conn = Some(conn);
        }

        tasks.push(tokio::spawn(rpc::run(config.clone(), state.clone(), executor.clone())));

        Ok(Self { config, state, broker_conn, tasks })
    }

    pub fn state(&self) -> Arc<AgentState> {
        self.state.clone()
    }

    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received, deregistering");

        if let Some(conn) = &self.broker_conn {
            if let Err(err) = broker::deregister(conn, &self.config).await {
                warn!(error = %err, "failed to publish deregistration");
            }
        }

        for task in self.tasks {
            task.abort();
        }
        Ok(())
    }
}
