use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

/// Backend selection mode, per spec §4.1.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RoutingMode {
    Auto,
    Local,
    Remote,
    Mac,
    Broker,
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoutingMode::Auto => "auto",
            RoutingMode::Local => "local",
            RoutingMode::Remote => "remote",
            RoutingMode::Mac => "mac",
            RoutingMode::Broker => "broker",
        };
        f.write_str(s)
    }
}

impl FromStr for RoutingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(RoutingMode::Auto),
            "local" => Ok(RoutingMode::Local),
            "remote" => Ok(RoutingMode::Remote),
            "mac" => Ok(RoutingMode::Mac),
            "broker" => Ok(RoutingMode::Broker),
            other => Err(ConfigError::UnknownRoutingMode(other.to_string())),
        }
    }
}

/// Gateway recognized options, per spec §6. `warmup_timeout=0` is invalid
/// and rejected at load (§8's boundary behaviors).
#[derive(Debug, Parser)]
#[command(name = "gateway", about = "Scale-to-zero inference gateway")]
pub struct Cli {
    /// HTTP bind address for client traffic.
    #[arg(long, env = "LISTEN_ADDR", default_value = ":8080")]
    pub listen_addr: String,

    /// Prometheus metrics bind address, served on a separate port.
    #[arg(long, env = "METRICS_ADDR", default_value = ":9090")]
    pub metrics_addr: String,

    /// Local backend base URL (e.g. `http://localhost:11434`).
    #[arg(long, env = "OLLAMA_URL", default_value = "")]
    pub ollama_url: String,

    /// Remote backend base URL. May be left empty when `fleet_api_url` is
    /// set, in which case the remote URL is resolved dynamically from the
    /// healthiest fleet member.
    #[arg(long, env = "REMOTE_OLLAMA_URL", default_value = "")]
    pub remote_ollama_url: String,

    /// Backend idle-shutdown duration.
    #[arg(long, env = "IDLE_TIMEOUT", default_value = "40m")]
    pub idle_timeout: String,

    /// Cold-start barrier timeout.
    #[arg(long, env = "WARMUP_TIMEOUT", default_value = "5m")]
    pub warmup_timeout: String,

    /// Enable broker-mediated inference routing.
    #[arg(long, env = "BROKER_MODE", default_value_t = false)]
    pub broker_mode: bool,

    /// Broker connection URL, required when `broker_mode` is set.
    #[arg(long, env = "RABBITMQ_URL", default_value = "")]
    pub rabbitmq_url: String,

    /// Fleet manager admin-HTTP base URL, used to resolve a remote backend
    /// dynamically and to query fleet health for `auto` routing.
    #[arg(long, env = "FLEET_API_URL", default_value = "")]
    pub fleet_api_url: String,

    /// Default routing mode applied when a request doesn't force one.
    #[arg(long, env = "ROUTING_MODE", default_value = "auto")]
    pub routing_mode: String,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    pub ollama_url: Option<String>,
    pub remote_ollama_url: Option<String>,
    pub idle_timeout: Duration,
    pub warmup_timeout: Duration,
    pub broker_mode: bool,
    pub rabbitmq_url: Option<String>,
    pub fleet_api_url: Option<String>,
    pub routing_mode: RoutingMode,
}

fn parse_addr(field: &'static str, raw: &str) -> Result<SocketAddr, ConfigError> {
    let raw = if raw.starts_with(':') { format!("0.0.0.0{raw}") } else { raw.to_string() };
    raw.parse().map_err(|source| ConfigError::InvalidAddr { field, source })
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

impl TryFrom<Cli> for GatewayConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let warmup_timeout = humantime::parse_duration(&cli.warmup_timeout)
            .map_err(|source| ConfigError::InvalidDuration { field: "warmup_timeout", source })?;
        if warmup_timeout.is_zero() {
            return Err(ConfigError::MustBePositive { field: "warmup_timeout" });
        }

        Ok(Self {
            listen_addr: parse_addr("listen_addr", &cli.listen_addr)?,
            metrics_addr: parse_addr("metrics_addr", &cli.metrics_addr)?,
            ollama_url: non_empty(cli.ollama_url),
            remote_ollama_url: non_empty(cli.remote_ollama_url),
            idle_timeout: humantime::parse_duration(&cli.idle_timeout)
                .map_err(|source| ConfigError::InvalidDuration { field: "idle_timeout", source })?,
            warmup_timeout,
            broker_mode: cli.broker_mode,
            rabbitmq_url: non_empty(cli.rabbitmq_url),
            fleet_api_url: non_empty(cli.fleet_api_url),
            routing_mode: cli.routing_mode.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            listen_addr: ":8080".into(),
            metrics_addr: ":9090".into(),
            ollama_url: "http://local:11434".into(),
            remote_ollama_url: "http://remote:11434".into(),
            idle_timeout: "40m".into(),
            warmup_timeout: "5m".into(),
            broker_mode: false,
            rabbitmq_url: "".into(),
            fleet_api_url: "".into(),
            routing_mode: "auto".into(),
        }
    }

    #[test]
    fn zero_warmup_timeout_is_rejected() {
        let mut cli = base_cli();
        cli.warmup_timeout = "0s".into();
        assert!(GatewayConfig::try_from(cli).is_err());
    }

    #[test]
    fn defaults_parse_cleanly() {
        let config = GatewayConfig::try_from(base_cli()).unwrap();
        assert_eq!(config.idle_timeout, Duration::from_secs(40 * 60));
        assert_eq!(config.routing_mode, RoutingMode::Auto);
    }

    #[test]
    fn empty_urls_are_none() {
        let mut cli = base_cli();
        cli.remote_ollama_url = "".into();
        let config = GatewayConfig::try_from(cli).unwrap();
        assert!(config.remote_ollama_url.is_none());
    }

    #[test]
    fn unknown_routing_mode_is_rejected() {
        let mut cli = base_cli();
        cli.routing_mode = "teleport".into();
        assert!(GatewayConfig::try_from(cli).is_err());
    }
}
