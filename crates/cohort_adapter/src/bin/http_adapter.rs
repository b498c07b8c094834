#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cohort_adapter::{http, AdapterConfig, AdapterRuntime};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AdapterConfig::from_env()?;
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = Arc::new(AdapterRuntime::from_config(&config)?);
    if config.allocation_worker_enabled {
        let runtime_for_worker = runtime.clone();
        let interval_ms = config.allocation_worker_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                if let Err(err) = runtime_for_worker.run_allocation_worker_pass().await {
                    error!(error = %err, "allocation worker pass failed");
                }
            }
        });
    }

    let app = http::router(runtime);

    info!(
        addr = %config.bind,
        worker_enabled = config.allocation_worker_enabled,
        worker_interval_ms = config.allocation_worker_interval_ms,
        journal = ?config.ledger_journal_path,
        "cohort_adapter_http listening"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
