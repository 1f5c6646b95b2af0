//! LiveCanvas relay server binary.

use std::sync::Arc;

use clap::Parser;
use livecanvas_server::{app, spawn_autosave, AppState, ServerConfig};
use tracing::info;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livecanvas_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::parse();
    let state = AppState::from_config(&config).map_err(std::io::Error::other)?;
    let state = Arc::new(state);
    let persistent = config.data_dir.is_some() || config.persist;
    if persistent {
        spawn_autosave(state.clone(), config.autosave_interval());
    }
    if config.public_key.is_some() {
        info!("Joins require a public key");
    }

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    info!("LiveCanvas relay server listening on {}", listener.local_addr()?);
    info!("WebSocket endpoint: ws://{}/ws", config.addr);

    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if persistent {
        let saved = state.save_all().await;
        info!("Saved {} room(s) on shutdown", saved);
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
