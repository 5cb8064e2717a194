use std::process::ExitCode;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use turnpike::{Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("Starting Turnpike demo server v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        mode = ?config.mode,
        "Configuration loaded"
    );

    // Metrics are best-effort; the pipeline runs fine without the exporter
    metrics::init_metrics();
    if let Some(addr) = config.metrics_addr()
        && let Err(e) = metrics::install_exporter(addr)
    {
        error!("Continuing without metrics exporter: {e}");
    }

    let (router, store) = build_router(&config);

    // Background purge sweep for expired rate-limit counters
    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    {
        let store = store.clone();
        let cancel = cancel.clone();
        let window = config.rate_limit_window.max(Duration::from_secs(1));
        let purge_interval = config.store_purge_interval;
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(purge_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.purge_expired(window);
                        metrics::record_store_size(store.len());
                        if removed > 0 {
                            debug!(removed, live = store.len(), "Purged expired rate-limit counters");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    // Bind and serve
    let listener = TcpListener::bind(config.server_addr()).await.map_err(|e| {
        error!("Failed to bind {}: {e}", config.server_addr());
        exitcode::UNAVAILABLE
    })?;
    info!("Listening on {}", config.server_addr());

    axum::serve(listener, router)
        .with_graceful_shutdown(utils::shutdown_signal())
        .await
        .map_err(|e| {
            error!("Server error: {e}");
            exitcode::SOFTWARE
        })?;

    // Stop background tasks before exiting
    cancel.cancel();
    tracker.close();
    tracker.wait().await;
    info!("Shutdown complete");

    Ok(())
}
