use broadcast_server::config::{DEFAULT_PORT, WEBSOCKET_URL};
use broadcast_server::{AppError, Settings, WebSocketServer};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> broadcast_server::Result<()> {
    // Load environment variables
    dotenv().ok();

    let config = Settings::new()?;

    // Initialize logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .map_err(|e| AppError::ConfigError(e.to_string()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Configuration loaded successfully ({})", config.environment);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.workers as usize)
        .enable_all()
        .build()?;

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    let result = runtime.block_on(serve(config));

    // Connection tasks were drained inside run(); this only bounds leftover blocking work
    runtime.shutdown_timeout(grace);
    info!("Server stopped");
    result
}

async fn serve(config: Settings) -> broadcast_server::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", DEFAULT_PORT)).await?;
    info!(
        "Server is listening on 0.0.0.0:{} with {} workers, clients connect to {}",
        DEFAULT_PORT, config.server.workers, WEBSOCKET_URL
    );

    let server = Arc::new(WebSocketServer::new(&config));
    server.run(listener, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
