//! HTTP surface: push webhook, OAuth consent, normalizer sessions, blobs

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use ingest::models::MediaType;
use ingest::sync::{ConnectionPush, register_watch};
use ingest::{ConnectionOnboarding, OwnerId, PushHandler, PushOutcome};
use log::{error, info, warn};
use serde::Deserialize;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/webhooks/gmail", post(gmail_push))
        .route("/oauth/start", get(oauth_start))
        .route("/oauth/callback", get(oauth_callback))
        .route(
            "/owners/{owner_id}/session",
            post(start_session).delete(end_session),
        )
        .route("/blobs/{*path}", get(serve_blob))
        .with_state(state)
}

/// Always 204: Pub/Sub redelivers on anything else, and duplicates are
/// already filtered by the cursor check.
async fn gmail_push(State(state): State<AppState>, body: Bytes) -> StatusCode {
    tokio::task::spawn_blocking(move || {
        match PushHandler::new(state.sync_context()).handle(&body) {
            PushOutcome::Handled(results) => {
                for (id, result) in results {
                    match result {
                        ConnectionPush::Synced(report) => info!(
                            "Push sync for connection {}: {} created, cursor {:?}",
                            id, report.documents_created, report.cursor
                        ),
                        ConnectionPush::Duplicate => {}
                        ConnectionPush::Failed(reason) => {
                            warn!("Push sync for connection {} failed: {}", id, reason)
                        }
                    }
                }
            }
            PushOutcome::UnknownMailbox | PushOutcome::Malformed(_) => {}
        }
    });
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct OAuthStart {
    owner: String,
}

async fn oauth_start(State(state): State<AppState>, Query(q): Query<OAuthStart>) -> Redirect {
    let nonce = state.consents.issue(&OwnerId::new(q.owner));
    let url = ConnectionOnboarding::new(&state.credentials, &state.tokens, &state.provider, &*state.store)
        .authorize_url(&state.oauth_redirect_uri(), &nonce);
    Redirect::to(&url)
}

#[derive(Deserialize)]
struct OAuthCallback {
    code: Option<String>,
    /// Nonce issued by `/oauth/start`, bound to the owner
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(State(state): State<AppState>, Query(q): Query<OAuthCallback>) -> Response {
    if let Some(err) = q.error {
        warn!("OAuth consent denied: {}", err);
        return (StatusCode::BAD_REQUEST, "consent denied").into_response();
    }
    let (Some(code), Some(nonce)) = (q.code, q.state) else {
        return (StatusCode::BAD_REQUEST, "missing code or state").into_response();
    };
    let Some(owner_id) = state.consents.redeem(&nonce) else {
        warn!("OAuth callback with unknown or expired state");
        return (StatusCode::BAD_REQUEST, "unknown or expired state").into_response();
    };

    let result = tokio::task::spawn_blocking(move || {
        let onboarding =
            ConnectionOnboarding::new(&state.credentials, &state.tokens, &state.provider, &*state.store);
        let conn = onboarding.complete(&owner_id, &code, &state.oauth_redirect_uri())?;

        if let Some(topic) = &state.config.push_topic
            && let Err(e) = register_watch(state.sync_context(), conn.id, topic)
        {
            warn!("Watch registration failed for {}: {}", conn.mailbox_address, e);
        }
        Ok::<_, ingest::IngestError>(conn)
    })
    .await;

    match result {
        Ok(Ok(conn)) => (
            StatusCode::OK,
            format!("Connected {}", conn.mailbox_address),
        )
            .into_response(),
        Ok(Err(e)) => {
            warn!("OAuth callback failed: {}", e);
            (StatusCode::BAD_GATEWAY, "could not connect mailbox").into_response()
        }
        Err(e) => {
            error!("OAuth task panicked: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn start_session(State(state): State<AppState>, Path(owner_id): Path<String>) -> StatusCode {
    if state.start_session(OwnerId::new(owner_id.clone())) {
        info!("Started normalizer session for owner {}", owner_id);
    }
    StatusCode::NO_CONTENT
}

async fn end_session(State(state): State<AppState>, Path(owner_id): Path<String>) -> StatusCode {
    let owner_id = OwnerId::new(owner_id);
    // Joining the session thread blocks
    let ended = tokio::task::spawn_blocking(move || state.end_session(&owner_id)).await;
    match ended {
        Ok(true) => StatusCode::NO_CONTENT,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Serve a stored blob decompressed
async fn serve_blob(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    let content_type = MediaType::from_extension(&path)
        .map(|m| m.mime().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let read = tokio::task::spawn_blocking(move || state.blob_files.read_path(&path)).await;
    match read {
        Ok(Ok(Some(bytes))) => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        Ok(Ok(None)) => StatusCode::NOT_FOUND.into_response(),
        Ok(Err(e)) => {
            warn!("Failed to read blob: {:#}", e);
            StatusCode::BAD_REQUEST.into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
