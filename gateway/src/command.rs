use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, GatewayConfig};
use crate::service::GatewayService;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let cli = Cli::parse();
    let config = GatewayConfig::try_from(cli)?;

    let service = GatewayService::build(config).await?;
    service.run_until_stopped().await
}
