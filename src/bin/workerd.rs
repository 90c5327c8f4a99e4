//! Worker daemon entry point. Wires up logging and configuration; the
//! pull-loop that asks a coordinator for work over RPC, and the concrete
//! `CoordinatorApi`/`WorkerApi` transport it runs over, are deployment
//! concerns supplied by whatever transport crate a given cluster chooses
//! and are not started here.

use shuttlecore::CoreConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("SHUTTLE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("shuttle.toml"));
    let config = CoreConfig::load(&config_path)?;
    tracing::info!(path = %config_path.display(), ?config, "loaded worker configuration");

    tracing::info!(
        merge_init_parallelism = config.merge_init_parallelism,
        "worker ready; pull-loop RPC client wiring is deployment-specific"
    );
    tokio::signal::ctrl_c().await?;
    tracing::info!("worker shutting down");
    Ok(())
}
