use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use fieldsync::app_state::AppState;
use fieldsync::config::AppConfig;
use fieldsync::routes;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env()?;

    tracing::info!("Initializing fieldsync daemon");

    let prometheus_handle = Arc::new(PrometheusBuilder::new().install_recorder()?);
    routes::metrics::describe();

    let state = AppState::from_config(&config).await?;

    match state.ledger.clean_old_audit_logs(config.audit_retention_days).await {
        Ok(pruned) => tracing::info!(pruned, days = config.audit_retention_days, "Pruned old audit rows"),
        Err(e) => tracing::warn!(error = %e, "Audit pruning failed"),
    }

    // Action queue runs on startup and on every connectivity restore
    let processor = state.actions.clone().spawn(state.connectivity.subscribe());

    // Resume any photo jobs left over from the previous run
    if state.jobs.len().await? > 0 {
        tracing::info!("Pending photo jobs found, starting upload worker");
        state.worker.ensure_running();
    }

    let app = routes::api_router(state.clone())
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    state.worker.request_stop();
    processor.abort();
    state.ledger.close().await;
    Ok(())
}
