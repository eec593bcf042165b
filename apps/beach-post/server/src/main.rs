use anyhow::Result;
use beach_post_server::{
    config::{Cli, NodeConfig},
    telemetry::Telemetry,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::init(cli.otel_stdout)?;
    let config = NodeConfig::resolve(cli)?;

    info!(
        listen_addr = %config.listen_addr,
        machine_id = %config.machine_id,
        seed = ?config.seed,
        fanout = ?config.cluster.fanout,
        poll_timeout_secs = config.poll_timeout.as_secs(),
        "starting beach-post node"
    );

    beach_post_server::run(config, telemetry.metrics_handle()).await
}
