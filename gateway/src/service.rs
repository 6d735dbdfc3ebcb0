use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::GatewayConfig;
use crate::http;
use crate::provision::{NullProvisioner, ProvisioningCapability, ShellProvisioner};
use crate::state::GatewayState;
use crate::{broker, idle, metrics};

fn build_provisioner() -> Arc<dyn ProvisioningCapability> {
    let provision_cmd = std::env::var("PROVISION_CMD").ok();
    let terminate_cmd = std::env::var("TERMINATE_CMD").ok();
    if provision_cmd.is_none() && terminate_cmd.is_none() {
        return Arc::new(NullProvisioner);
    }
    Arc::new(ShellProvisioner { provision_cmd, terminate_cmd, command_timeout: std::time::Duration::from_secs(120) })
}

/// Composition root: builds gateway state, spawns the idle watcher and
/// (when configured) the broker reply consumer, and binds both listeners.
pub struct GatewayService {
    config: GatewayConfig,
    state: Arc<GatewayState>,
    tasks: Vec<JoinHandle<()>>,
}

impl GatewayService {
    pub async fn build(config: GatewayConfig) -> anyhow::Result<Self> {
        metrics::init();
        let mut state = GatewayState::new(config.clone(), build_provisioner());

        let mut broker_task = None;
        if config.broker_mode {
            let url = config
                .rabbitmq_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("broker_mode requires rabbitmq_url"))?;
            let conn = fleet_broker::BrokerConnection::new(url);
            let reply_queue = broker::declare_reply_queue(&conn).await?;
            info!(%reply_queue, "broker reply queue declared");
            broker_task = Some((conn.clone(), reply_queue.clone()));
            state = state.with_broker(conn, reply_queue);
        }

        let state = Arc::new(state);
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(idle::run(state.clone())));

        if let Some((conn, reply_queue)) = broker_task {
            tasks.push(tokio::spawn(broker::run_reply_consumer(conn, reply_queue, state.reply_correlator.clone())));
        }

        Ok(Self { config, state, tasks })
    }

    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        let listen_addr = self.config.listen_addr;
        let metrics_addr = self.config.metrics_addr;

        let client_router = http::client_router(self.state.clone());
        let metrics_router = http::metrics_router(self.state.clone());

        let client_listener = tokio::net::TcpListener::bind(listen_addr).await?;
        let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
        info!(%listen_addr, %metrics_addr, "gateway listeners bound");

        tokio::select! {
            result = axum::serve(client_listener, client_router) => {
                result.map_err(|err| anyhow::anyhow!("client HTTP server error: {err}"))?;
            }
            result = axum::serve(metrics_listener, metrics_router) => {
                result.map_err(|err| anyhow::anyhow!("metrics HTTP server error: {err}"))?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, draining background tasks");
            }
        }

        for task in self.tasks {
            task.abort();
        }
        Ok(())
    }
}
