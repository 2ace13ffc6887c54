use clap::Parser;
use pier::config::{Cli, ServerConfig};
use pier::telemetry::Telemetry;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        kubectl = %config.app.kubernetes.kubectl,
        watch_timeout_secs = config.watch_timeout.as_secs(),
        "starting pier"
    );

    pier::run(config, Some(telemetry.metrics_handle())).await
}
