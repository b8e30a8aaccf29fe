//! Main Entrypoint for the Speech-to-Speech API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Loading the system prompt and knowledge base into the shared state.
//! 3. Constructing the Axum router and applying middleware.
//! 4. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use clap::Parser;
use s2s_api::{config::Config, router::create_router, state::AppState};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{Level, info};

#[derive(Parser, Debug)]
#[command(version, about = "Bridges browser audio to a realtime speech-to-speech model")]
struct Args {
    /// Log at debug level regardless of RUST_LOG.
    #[arg(long)]
    debug: bool,
}

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    let log_level = if args.debug {
        Level::DEBUG
    } else {
        config.log_level
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared State ---
    let app_state = Arc::new(AppState::from_config(config.clone())?);

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        upstream = %config.upstream_url,
        bind_address = %config.bind_address,
        tool_timeout = ?config.tool_timeout,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
