use fieldsync::{app_state::AppState, config::AppConfig};
use tracing_subscriber::EnvFilter;

/// One-shot drain: run the upload worker until the queue has been empty long
/// enough for it to stop itself.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting photo upload worker");

    let config = AppConfig::from_env()?;
    let state = AppState::from_config(&config).await?;

    let pending = state.jobs.len().await?;
    tracing::info!(pending, "Worker ready, draining photo job queue");

    let Some(handle) = state.worker.ensure_running() else {
        tracing::warn!("Upload worker already running");
        return Ok(());
    };
    let run = handle.await?;

    let failed = state.jobs.failed_entries().await?.len();
    tracing::info!(
        jobs_processed = run.jobs_processed,
        empty_observations = run.empty_observations,
        remaining = state.jobs.len().await?,
        failed,
        "Photo job queue drained"
    );

    state.ledger.close().await;
    Ok(())
}
