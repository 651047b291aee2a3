use std::sync::Arc;

use anyhow::Context;
use tandem_relay::{
    config::RelayConfig,
    metrics::{self, RelayMetrics},
    shutdown::shutdown_signal,
    state::RelayState,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    metrics::set_global_metrics(Arc::new(RelayMetrics::default()));

    let addr = config.listen_addr;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {addr}"))?;

    info!(
        listen_addr = %addr,
        default_room = %config.default_room,
        room_from_path = config.room_from_path,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        "starting relay server"
    );

    tandem_relay::serve(listener, RelayState::new(config), shutdown_signal()).await?;

    info!("relay stopped");
    Ok(())
}
