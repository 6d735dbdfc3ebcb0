use std::time::Duration;

use clap::Parser;
use fleet_primitives::NodeType;

use crate::error::ConfigError;

/// Worker agent recognized options, per spec §6.
#[derive(Debug, Parser)]
#[command(name = "worker-agent", about = "Fleet worker agent")]
pub struct Cli {
    /// Stable node identifier. Defaults to the machine hostname.
    #[arg(long, env = "NODE_ID", default_value = "")]
    pub node_id: String,

    /// Node class reported at registration (`gpu_worker`, `cpu_worker`, ...).
    #[arg(long, env = "NODE_TYPE", default_value = "gpu_worker")]
    pub node_type: String,

    /// Local inference engine base URL this agent probes and proxies for.
    #[arg(long, env = "WORKER_OLLAMA_URL", default_value = "http://localhost:11434")]
    pub worker_ollama_url: String,

    /// Comma-separated model names this node is expected to serve.
    #[arg(long, env = "WORKER_MODELS", default_value = "llama3,mistral,qwen")]
    pub worker_models: String,

    /// Max concurrent inference requests this node accepts from the broker.
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 1)]
    pub worker_concurrency: u32,

    /// Interval between heartbeat pushes on both transports.
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value = "30s")]
    pub heartbeat_interval: String,

    /// Broker connection URL. Leaving this empty disables broker-mediated
    /// registration/heartbeat/inference; the agent then relies on the RPC
    /// transport alone.
    #[arg(long, env = "RABBITMQ_URL", default_value = "")]
    pub rabbitmq_url: String,

    /// Fleet manager gRPC control-plane address.
    #[arg(long, env = "CONTROLLER_GRPC_ADDR", default_value = "http://localhost:7070")]
    pub controller_grpc_addr: String,

    /// Cloud/VM instance identifier, reported at registration.
    #[arg(long, env = "INSTANCE_ID", default_value = "")]
    pub instance_id: String,

    /// Overlay mesh address (Nebula), reported at registration.
    #[arg(long, env = "NEBULA_IP", default_value = "")]
    pub nebula_ip: String,

    /// Public address, reported at registration.
    #[arg(long, env = "PUBLIC_IP", default_value = "")]
    pub public_ip: String,

    /// Region label, reported at registration.
    #[arg(long, env = "REGION", default_value = "")]
    pub region: String,

    /// Availability zone label, reported at registration.
    #[arg(long, env = "AVAILABILITY_ZONE", default_value = "")]
    pub availability_zone: String,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub node_id: String,
    pub node_type: NodeType,
    pub worker_ollama_url: String,
    pub worker_models: Vec<String>,
    pub worker_concurrency: u32,
    pub heartbeat_interval: Duration,
    pub rabbitmq_url: Option<String>,
    pub controller_grpc_addr: String,
    pub instance_id: String,
    pub nebula_ip: Option<String>,
    pub public_ip: Option<String>,
    pub region: Option<String>,
    pub availability_zone: Option<String>,
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "unknown-node".to_string())
}

impl TryFrom<Cli> for WorkerConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let heartbeat_interval = humantime::parse_duration(&cli.heartbeat_interval)
            .map_err(|source| ConfigError::InvalidDuration { field: "heartbeat_interval", source })?;
        if heartbeat_interval.is_zero() {
            return Err(ConfigError::MustBePositive { field: "heartbeat_interval" });
        }

        let worker_models: Vec<String> =
            cli.worker_models.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        if worker_models.is_empty() {
            return Err(ConfigError::EmptyModelList);
        }

        let node_id = non_empty(cli.node_id).unwrap_or_else(local_hostname);

        Ok(Self {
            node_id,
            node_type: cli.node_type.parse().unwrap_or(NodeType::Unspecified),
            worker_ollama_url: cli.worker_ollama_url,
            worker_models,
            worker_concurrency: cli.worker_concurrency.max(1),
            heartbeat_interval,
            rabbitmq_url: non_empty(cli.rabbitmq_url),
            controller_grpc_addr: cli.controller_grpc_addr,
            instance_id: cli.instance_id,
            nebula_ip: non_empty(cli.nebula_ip),
            public_ip: non_empty(cli.public_ip),
            region: non_empty(cli.region),
            availability_zone: non_empty(cli.availability_zone),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            node_id: "".into(),
            node_type: "gpu_worker".into(),
            worker_ollama_url: "http://localhost:11434".into(),
            worker_models: "llama3,mistral,qwen".into(),
            worker_concurrency: 1,
            heartbeat_interval: "30s".into(),
            rabbitmq_url: "".into(),
            controller_grpc_addr: "http://localhost:7070".into(),
            instance_id: "".into(),
            nebula_ip: "".into(),
            public_ip: "".into(),
            region: "".into(),
            availability_zone: "".into(),
        }
    }

    #[test]
    fn defaults_parse_cleanly() {
        let config = WorkerConfig::try_from(base_cli()).unwrap();
        assert_eq!(config.worker_models, vec!["llama3", "mistral", "qwen"]);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.node_type, NodeType::GpuWorker);
    }

    #[test]
    fn zero_heartbeat_interval_is_rejected() {
        let mut cli = base_cli();
        cli.heartbeat_interval = "0s".into();
        assert!(WorkerConfig::try_from(cli).is_err());
    }

    #[test]
    fn blank_model_list_is_rejected() {
        let mut cli = base_cli();
        cli.worker_models = " , ,".into();
        assert!(WorkerConfig::try_from(cli).is_err());
    }

    #[test]
    fn empty_node_id_falls_back_to_hostname() {
        let config = WorkerConfig::try_from(base_cli()).unwrap();
        assert!(!config.node_id.is_empty());
    }
}
