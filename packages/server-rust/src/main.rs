use std::sync::Arc;

use clap::Parser;
use tracing::info;

use reqlog_server::todo::{self, InMemoryRepository};
use reqlog_server::{network, telemetry, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    config.validate()?;
    telemetry::init(&config.log)?;

    if let Some(port) = config.metrics_port {
        telemetry::install_metrics_exporter(&config.host, port)?;
    }

    info!(
        host = %config.host,
        port = config.grpc_port,
        auth = config.auth_enabled,
        log_payload = config.log_payload,
        "starting reqlog server"
    );

    let repo = Arc::new(InMemoryRepository::new());
    network::run(config, move |pipeline| todo::routes(repo, pipeline)).await?;

    info!("reqlog server stopped");
    Ok(())
}
