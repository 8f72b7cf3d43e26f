//! Parley Server - HTTP surface for the conversational backend.
//!
//! Wires the session store, image cache, upstream client, and reaper
//! into an axum application and runs it to completion.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod routes;

pub use routes::{build_router, AppState};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parley_common::config::Config;
use parley_core::conversation::HistoryPolicy;
use parley_core::{ChatClient, ImageCache, Orchestrator, Reaper, ReaperConfig, SessionStore};

/// Construct the shared application state from configuration.
pub fn build_state(config: &Config) -> parley_common::Result<AppState> {
    let sessions = Arc::new(SessionStore::new(config.session.system_prompt.clone()));
    let images = Arc::new(ImageCache::new(config.image.clone()));
    let policy: HistoryPolicy = config.session.history.parse()?;
    let backend = Arc::new(ChatClient::new(config.upstream.clone())?);
    let orchestrator = Arc::new(Orchestrator::new(
        backend,
        config.upstream.clone(),
        policy,
        config.language.clone(),
    ));

    Ok(AppState {
        sessions,
        images,
        orchestrator,
    })
}

/// Run the server until a shutdown signal arrives.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let state = build_state(config)?;

    let reaper = Reaper::new(
        Arc::clone(&state.sessions),
        Arc::clone(&state.images),
        ReaperConfig {
            ttl: Duration::from_secs(config.session.ttl_secs),
            sweep_interval: Duration::from_secs(config.session.sweep_interval_secs),
        },
    )
    .start();

    let router = build_router(state, config.server.max_body_bytes);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(%addr, "Parley server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
