use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, FleetManagerConfig};
use crate::service::FleetManagerService;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let cli = Cli::parse();
    let config = FleetManagerConfig::try_from(cli)?;

    let service = FleetManagerService::build(config).await?;
    service.run_until_stopped().await
}
