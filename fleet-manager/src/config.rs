use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

/// Fleet manager recognized options, per spec §6.
#[derive(Debug, Parser)]
#[command(name = "fleet-manager", about = "Fleet manager / control-plane controller")]
pub struct Cli {
    /// RPC (gRPC) bind address.
    #[arg(long, env = "GRPC_ADDR", default_value = ":50051")]
    pub grpc_addr: String,

    /// Admin HTTP bind address.
    #[arg(long, env = "HTTP_ADDR", default_value = ":8090")]
    pub http_addr: String,

    /// Threshold for healthy -> stale.
    #[arg(long, env = "STALE_TIMEOUT", default_value = "2m")]
    pub stale_timeout: String,

    /// Threshold for stale -> dead.
    #[arg(long, env = "DEAD_THRESHOLD", default_value = "5m")]
    pub dead_threshold: String,

    /// Broker connection URL; empty disables the broker consumer.
    #[arg(long, env = "RABBITMQ_URL", default_value = "")]
    pub rabbitmq_url: String,

    /// Enqueue a shutdown command on dead transition.
    #[arg(long, env = "AUTO_TERMINATE_DEAD", default_value_t = false)]
    pub auto_terminate_dead: bool,
}

#[derive(Debug, Clone)]
pub struct FleetManagerConfig {
    pub grpc_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub stale_timeout: Duration,
    pub dead_threshold: Duration,
    pub rabbitmq_url: Option<String>,
    pub auto_terminate_dead: bool,
}

fn parse_addr(field: &'static str, raw: &str) -> Result<SocketAddr, ConfigError> {
    let raw = if raw.starts_with(':') { format!("0.0.0.0{raw}") } else { raw.to_string() };
    raw.parse().map_err(|source| ConfigError::InvalidAddr { field, source })
}

impl TryFrom<Cli> for FleetManagerConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        Ok(Self {
            grpc_addr: parse_addr("grpc_addr", &cli.grpc_addr)?,
            http_addr: parse_addr("http_addr", &cli.http_addr)?,
            stale_timeout: humantime::parse_duration(&cli.stale_timeout)
                .map_err(|source| ConfigError::InvalidDuration { field: "stale_timeout", source })?,
            dead_threshold: humantime::parse_duration(&cli.dead_threshold)
                .map_err(|source| ConfigError::InvalidDuration { field: "dead_threshold", source })?,
            rabbitmq_url: if cli.rabbitmq_url.trim().is_empty() { None } else { Some(cli.rabbitmq_url) },
            auto_terminate_dead: cli.auto_terminate_dead,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colon_prefixed_addr_binds_all_interfaces() {
        let addr = parse_addr("grpc_addr", ":50051").unwrap();
        assert_eq!(addr.port(), 50051);
        assert!(addr.ip().is_unspecified());
    }

    #[test]
    fn empty_rabbitmq_url_disables_broker_consumer() {
        let cli = Cli {
            grpc_addr: ":50051".into(),
            http_addr: ":8090".into(),
            stale_timeout: "2m".into(),
            dead_threshold: "5m".into(),
            rabbitmq_url: "".into(),
            auto_terminate_dead: false,
        };
        let config = FleetManagerConfig::try_from(cli).unwrap();
        assert!(config.rabbitmq_url.is_none());
    }
}
