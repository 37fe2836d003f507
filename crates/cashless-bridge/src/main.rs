use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod backend;
mod bridge;
mod config;
mod events;
mod server;
mod session;

use backend::BackendClient;
use bridge::Bridge;
use config::BridgeConfig;
use server::AppState;
use session::{CardPoller, PcscSource, PollerCommand, SharedSession};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber with environment-based filtering
    // Set RUST_LOG=debug for detailed logs, RUST_LOG=trace for very verbose
    // Default: info level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = BridgeConfig::parse();
    info!(
        api = %config.api_base_url,
        protocol = ?config.card_protocol,
        "starting cashless bridge"
    );

    let session = SharedSession::new();
    let (events, _) = broadcast::channel(64);
    let api = Arc::new(BackendClient::new(&config)?);
    let protocol = config.card_protocol.protocol();

    let (poller, poller_commands) = CardPoller::spawn(
        session.clone(),
        events.clone(),
        protocol.clone(),
        config.poll_timing(),
        Box::new(PcscSource::default()),
    );

    let state = Arc::new(AppState {
        bridge: Arc::new(Bridge::new(session.clone(), api, protocol)),
        session,
        events,
    });

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!(listen = %config.listen, "event channel listening");

    axum::serve(listener, server::create_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Stop the detection loop and release the card before exiting.
    let _ = poller_commands.send(PollerCommand::Stop);
    let _ = tokio::task::spawn_blocking(move || poller.join()).await;

    Ok(())
}
