// scrapepool service binary
//
// Boots the context pool against a real Chromium and serves the HTTP
// control surface until ctrl-c.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use scrapepool::{ChromiumDriver, PoolSettings, ScraperPool, api};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = PoolSettings::from_env();
    info!(
        "Starting scrapepool: max_contexts={}, bind={}",
        settings.max_contexts, settings.bind_addr
    );

    let driver = Arc::new(ChromiumDriver::new());
    let pool = ScraperPool::new(settings.clone(), driver);
    pool.start().await.context("Failed to start context pool")?;

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.bind_addr))?;
    info!("Listening on {}", settings.bind_addr);

    let app = api::router(Arc::clone(&pool));
    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    let result = serve.await;

    pool.stop().await;
    result.context("HTTP server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    } else {
        info!("Shutdown signal received");
    }
}
