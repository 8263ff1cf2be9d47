//! Sync triggers, configuration, queue and session endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bankfeed_core::auth::Authenticator;
use bankfeed_core::queue::{QueueDrainSummary, TransactionQueueItem};
use bankfeed_core::sync::{AppLifecycle, SyncConfig, SyncConfigUpdate, SyncOutcome, SyncStats};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiResult;
use crate::main_lib::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStateChange {
    pub state: AppLifecycle,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub signed_in: bool,
}

async fn sync_all(State(state): State<Arc<AppState>>) -> Json<SyncOutcome> {
    Json(state.engine.sync_all_accounts().await)
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<SyncConfig> {
    Json(state.engine.sync_config().await)
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(update): Json<SyncConfigUpdate>,
) -> ApiResult<Json<SyncConfig>> {
    Ok(Json(state.engine.update_sync_config(update).await?))
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<SyncStats> {
    Json(state.engine.sync_stats().await)
}

async fn list_queue(State(state): State<Arc<AppState>>) -> Json<Vec<TransactionQueueItem>> {
    Json(state.engine.queue_items().await)
}

async fn drain_queue(State(state): State<Arc<AppState>>) -> Json<QueueDrainSummary> {
    Json(state.engine.drain_queue().await)
}

async fn app_state_changed(
    State(state): State<Arc<AppState>>,
    Json(change): Json<AppStateChange>,
) -> Json<Option<SyncOutcome>> {
    Json(state.engine.handle_app_state_change(change.state).await)
}

async fn session_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<SessionStatus>> {
    let signed_in = state.authenticator.is_authenticated().await?;
    Ok(Json(SessionStatus { signed_in }))
}

async fn sign_in(State(state): State<Arc<AppState>>) -> StatusCode {
    state.authenticator.sign_in();
    info!("[Auth] Session started");
    StatusCode::NO_CONTENT
}

async fn sign_out(State(state): State<Arc<AppState>>) -> StatusCode {
    state.authenticator.sign_out();
    info!("[Auth] Session ended");
    StatusCode::NO_CONTENT
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sync", post(sync_all))
        .route("/sync/config", get(get_config).put(update_config))
        .route("/sync/stats", get(get_stats))
        .route("/queue", get(list_queue))
        .route("/queue/drain", post(drain_queue))
        .route("/app-state", post(app_state_changed))
        .route(
            "/session",
            get(session_status).post(sign_in).delete(sign_out),
        )
}
