use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use efsec_server::{relay, routes, AppState};

/// Relay TTL sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let db_path = std::env::var("EFSEC_DB").unwrap_or_else(|_| "sqlite://efsec-server.db".into());
    let bind = std::env::var("EFSEC_BIND").unwrap_or_else(|_| "127.0.0.1:8470".into());

    let state = AppState::open(&db_path).await.context("open server database")?;

    // Background TTL sweep for the ephemeral relay.
    let sweep_pool = state.pool.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(error) = relay::sweep_expired(&sweep_pool).await {
                tracing::error!(event = "relay_sweep_failed", error = %error);
            }
        }
    });

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(event = "server_listening", bind = %bind);
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}
