//! Poll scheduler and watch renewal

use chrono::Utc;
use ingest::sync::{due_connections, register_watch, run_batch};
use ingest::{IngestError, SyncMode};
use log::{debug, info, warn};
use std::time::Duration;

use crate::state::AppState;

/// Watches lapse after seven days; renew well before that
const WATCH_RENEW_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on how often due connections are checked
const MAX_TICK: Duration = Duration::from_secs(60);

/// Run incremental syncs for every connection whose poll interval elapsed
pub fn start(state: AppState) {
    let tick = Duration::from_secs(state.config.poll_interval_secs.max(1)).min(MAX_TICK);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let state = state.clone();
            let result = tokio::task::spawn_blocking(move || poll_once(&state)).await;
            if let Err(e) = result {
                warn!("Scheduler task panicked: {}", e);
            }
        }
    });
}

fn poll_once(state: &AppState) {
    let due = match due_connections(&*state.store, state.config.poll_interval_secs, Utc::now()) {
        Ok(due) => due,
        Err(e) => {
            warn!("Scheduler: listing connections failed: {}", e);
            return;
        }
    };
    if due.is_empty() {
        debug!("Scheduler: nothing due");
        return;
    }

    for (id, result) in run_batch(state.sync_context(), &due, SyncMode::Incremental) {
        match result {
            Ok(report) => info!(
                "Scheduled sync for connection {}: located {}, created {}, skipped {}, failed {}{}",
                id,
                report.located,
                report.documents_created,
                report.skipped_existing,
                report.failures,
                if report.used_fallback { " (fallback)" } else { "" }
            ),
            Err(IngestError::Busy(_)) => debug!("Connection {} busy, skipped", id),
            // Already logged by the batch driver
            Err(_) => {}
        }
    }
}

/// Re-register push notifications daily when a topic is configured
pub fn start_watch_renewal(state: AppState) {
    let Some(topic) = state.config.push_topic.clone() else {
        return;
    };

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(WATCH_RENEW_INTERVAL);
        loop {
            interval.tick().await;
            let state = state.clone();
            let topic = topic.clone();
            let _ = tokio::task::spawn_blocking(move || renew_watches(&state, &topic)).await;
        }
    });
}

fn renew_watches(state: &AppState, topic: &str) {
    let connections = match state.store.list_active_connections() {
        Ok(connections) => connections,
        Err(e) => {
            warn!("Watch renewal: listing connections failed: {}", e);
            return;
        }
    };
    for conn in connections {
        if let Err(e) = register_watch(state.sync_context(), conn.id, topic) {
            warn!("Watch renewal failed for connection {}: {}", conn.id, e);
        }
    }
}
