use std::sync::Arc;

use fleet_rpc::FleetControlServer;
use tokio::task::JoinHandle;
use tonic::transport::Server as GrpcServer;
use tracing::info;

use crate::config::FleetManagerConfig;
use crate::grpc::FleetControlService;
use crate::http::{self, AdminState};
use crate::registry::Registry;
use crate::{broker, callbacks, metrics, ttl};

/// Composition root: builds the registry, binds both listeners, and spawns
/// every independently-scheduled unit described in spec §5. Mirrors the
/// teacher's `service.rs` role of "build parts, spawn named tasks, hand
/// back a handle the binary awaits".
pub struct FleetManagerService {
    config: FleetManagerConfig,
    registry: Arc<Registry>,
    tasks: Vec<JoinHandle<()>>,
}

impl FleetManagerService {
    pub async fn build(config: FleetManagerConfig) -> anyhow::Result<Self> {
        metrics::init();
        let (registry, events) = Registry::new();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(callbacks::run(events)));
        tasks.push(tokio::spawn(ttl::run(
            registry.clone(),
            config.stale_timeout,
            config.dead_threshold,
            config.auto_terminate_dead,
        )));

        if let Some(url) = config.rabbitmq_url.clone() {
            let conn = fleet_broker::BrokerConnection::new(url);
            tasks.push(tokio::spawn(broker::run_registration_consumer(conn.clone(), registry.clone())));
            tasks.push(tokio::spawn(broker::run_heartbeat_consumer(conn, registry.clone())));
            info!("broker registration/heartbeat consumers started");
        } else {
            info!("rabbitmq_url not set, broker consumer disabled");
        }

        Ok(Self { config, registry, tasks })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Binds the gRPC and admin-HTTP listeners and runs until either
    /// exits or a shutdown signal arrives.
    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        let grpc_addr = self.config.grpc_addr;
        let http_addr = self.config.http_addr;

        let control_service = FleetControlServer::new(FleetControlService::new(self.registry.clone()));
        let admin_router = http::router(AdminState { registry: self.registry.clone() });

        let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
        info!(%grpc_addr, %http_addr, "fleet manager listeners bound");

        tokio::select! {
            result = GrpcServer::builder().add_service(control_service).serve(grpc_addr) => {
                result.map_err(|err| anyhow::anyhow!("gRPC server error: {err}"))?;
            }
            result = axum::serve(http_listener, admin_router) => {
                result.map_err(|err| anyhow::anyhow!("admin HTTP server error: {err}"))?;
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
