use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bankfeed_core::alerts::SyncAlert;

use crate::error::ApiResult;
use crate::main_lib::AppState;

async fn list_alerts(State(state): State<Arc<AppState>>) -> Json<Vec<SyncAlert>> {
    Json(state.engine.alerts().await)
}

async fn unread_alerts(State(state): State<Arc<AppState>>) -> Json<Vec<SyncAlert>> {
    Json(state.engine.get_unread_alerts().await)
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(alert_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.mark_alert_as_read(&alert_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_alerts(State(state): State<Arc<AppState>>) -> StatusCode {
    state.engine.clear_alerts().await;
    StatusCode::NO_CONTENT
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/alerts", get(list_alerts).delete(clear_alerts))
        .route("/alerts/unread", get(unread_alerts))
        .route("/alerts/{id}/read", post(mark_read))
}
