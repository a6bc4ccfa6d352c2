//! ingestd - Email invoice ingestion daemon
//!
//! Hosts the push webhook, the poll scheduler and per-owner preview
//! normalizer sessions on top of the `ingest` engine.

use anyhow::{Context, Result};
use ingest::{EngineConfig, GmailCredentials};
use log::{error, info, warn};
use std::sync::Arc;

mod routes;
mod scheduler;
mod state;

use state::Services;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let engine = EngineConfig::load().context("Failed to load engine config")?;
    let credentials = match GmailCredentials::load() {
        Ok(creds) => creds,
        Err(e) => {
            if let Some(path) = GmailCredentials::default_credentials_path() {
                warn!(
                    "To configure Gmail access, either:\n\
                     1. Place your Google OAuth credentials at: {}\n\
                     2. Or set environment variables: GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET",
                    path.display()
                );
            }
            return Err(e.context("Gmail credentials not found"));
        }
    };

    let bind = engine.bind_address.clone();
    let state = Arc::new(Services::build(engine, credentials)?);

    scheduler::start(state.clone());
    scheduler::start_watch_renewal(state.clone());

    let app = routes::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop normalizer threads before exit
    let sessions = std::mem::take(&mut *state.sessions.lock().unwrap());
    drop(sessions);
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let term = async {
        if let Ok(mut s) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            s.recv().await;
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();
    tokio::select! { _ = ctrl_c => {}, _ = term => {} }
}
