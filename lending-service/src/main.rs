use anyhow::{Context, Result};
use poem::{listener::TcpListener, Route, Server};
use poem_openapi::OpenApiService;
use std::env;
use std::sync::Arc;
use tokio::signal;

use quas_custody::{LendingProtocol, MempoolClient};

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("quas_lending=info,quas_custody=info,poem=info")
            }),
        )
        .init();

    // Load configuration
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    tracing::info!("Loading configuration from: {}", config_path);

    let config = config::ConfigFile::load(&config_path)?;
    config.validate()?;

    run(config).await
}

async fn run(config: config::ConfigFile) -> Result<()> {
    let network = config.network.bitcoin_network()?;
    let keys = Arc::new(config.key_set()?);
    let chain = Arc::new(MempoolClient::new(config.chain.base_url.clone()));

    let lending = LendingProtocol::new(keys, network, chain, config.custody.policy)
        .context("Failed to build lending protocol")?;
    let protocol = lending.protocol_address()?;

    tracing::info!("Network: {}", network);
    tracing::info!("Chain API: {}", config.chain.base_url);
    tracing::info!("Protocol address: {}", protocol.address());
    tracing::info!(
        "Policy: dust floor {} sat, postage {} sat, {:?} selection",
        config.custody.policy.dust_floor,
        config.custody.policy.postage,
        config.custody.policy.selection_order
    );

    let api = api::Api {
        lending: Arc::new(lending),
    };

    let api_service = OpenApiService::new(api, "Quas Lending", "1.0");

    let ui = api_service.scalar();
    let spec = api_service.spec_endpoint();

    let app = Route::new()
        .nest("/", api_service)
        .nest("/docs", ui)
        .nest("/spec", spec);

    tracing::info!(
        "Lending service listening on {}:{}",
        config.server.host,
        config.server.port
    );
    tracing::info!(
        "Documentation: http://{}:{}/docs",
        config.server.host,
        config.server.port
    );

    Server::new(TcpListener::bind(format!(
        "{}:{}",
        config.server.host, config.server.port
    )))
    .run_with_graceful_shutdown(app, shutdown_signal(), None)
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping lending service");
}
