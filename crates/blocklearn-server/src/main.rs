//! # blocklearn-server
//!
//! Signaling relay for BlockLearn calls.
//!
//! Browsers (or headless engines) connect over WebSocket at `/ws`, join a
//! room by key and exchange offers, answers, ICE candidates and room events
//! through the relay. The relay never inspects media and keeps no state
//! beyond live room membership.
//!
//! HTTP endpoints: `/health`, `/info`, `/rooms` and `/rooms/:room`, all rate
//! limited per client IP.

mod api;
mod config;
mod error;
mod rate_limit;
mod rooms;
mod ws;

use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,blocklearn_server=debug")),
        )
        .init();

    info!("Starting BlockLearn relay v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let http_addr = config.http_addr;
    let state = AppState::new(config);

    // Evict rate-limit buckets idle for more than 10 minutes.
    let http_limiter = state.http_limiter.clone();
    let frame_limiter = state.frame_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let evicted = http_limiter.purge_idle(Duration::from_secs(600)).await
                + frame_limiter.purge_idle(Duration::from_secs(600)).await;
            if evicted > 0 {
                tracing::debug!(evicted, "Purged idle rate-limit buckets");
            }
        }
    });

    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Relay server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
