//! Coordinator daemon entry point. Wires up logging, configuration, and
//! checkpoint-backed job resume; the RPC server that actually accepts
//! worker connections and the name-service leader-election lock are
//! concrete transport/deployment concerns and are not started here.

use shuttlecore::{CheckpointManager, Coordinator, CoreConfig, LoggingClusterRuntime, LoggingWorkerApi};
use std::path::PathBuf;
use std::sync::Arc;
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
    tracing::info!(path = %config_path.display(), ?config, "loaded coordinator configuration");

    let database_url = std::env::var("SHUTTLE_DB").unwrap_or_else(|_| "sqlite://shuttle.db".to_string());
    let checkpoints = Arc::new(CheckpointManager::connect(&database_url).await?);
    let coordinator = Coordinator::new(
        Arc::new(config),
        Arc::new(LoggingClusterRuntime),
        Arc::new(LoggingWorkerApi),
        checkpoints.clone(),
    );

    let active = checkpoints.active_job_ids().await?;
    if active.is_empty() {
        tracing::info!("no jobs to resume from checkpoint");
    } else {
        tracing::info!(count = active.len(), "resuming jobs from checkpoint");
        for job_id in active {
            match checkpoints.load_snapshot(job_id).await {
                Ok(Some(snapshot)) => {
                    let nodes = snapshot.nodes.len();
                    match coordinator.resume_job(snapshot) {
                        Ok(resumed_id) => tracing::info!(job_id = %resumed_id, nodes, "job resumed from checkpoint"),
                        Err(err) => tracing::error!(%job_id, %err, "failed to rebuild job tracker from snapshot"),
                    }
                }
                Ok(None) => tracing::warn!(%job_id, "job listed as active but has no snapshot"),
                Err(err) => tracing::error!(%job_id, %err, "failed to load snapshot"),
            }
        }
    }

    let active_count = coordinator.list_jobs(true).await?.len();
    tracing::info!(
        jobs = active_count,
        "coordinator ready; RPC transport and name-service registration are deployment-specific"
    );
    tokio::signal::ctrl_c().await?;
    tracing::info!("coordinator shutting down");
    Ok(())
}
