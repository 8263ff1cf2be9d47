//! Connection lifecycle and account endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bankfeed_core::connections::{
    AccountSummary, BankAccount, BankConnection, ConnectCredentials,
};
use bankfeed_core::sync::SyncOutcome;
use serde::Serialize;
use tracing::info;

use crate::error::ApiResult;
use crate::main_lib::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub connection: BankConnection,
    pub accounts: Vec<BankAccount>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub valid: bool,
}

async fn connect_account(
    State(state): State<Arc<AppState>>,
    Json(credentials): Json<ConnectCredentials>,
) -> ApiResult<(StatusCode, Json<ConnectResponse>)> {
    info!("[Connect] Connecting {}", credentials.institution_name);
    let (connection, accounts) = state.engine.connect_account(credentials).await?;
    Ok((
        StatusCode::CREATED,
        Json(ConnectResponse {
            connection,
            accounts,
        }),
    ))
}

async fn list_connections(State(state): State<Arc<AppState>>) -> Json<Vec<BankConnection>> {
    Json(state.engine.connections().await)
}

async fn reauthenticate(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    Json(credentials): Json<ConnectCredentials>,
) -> ApiResult<Json<BankConnection>> {
    let connection = state
        .engine
        .reauthenticate_connection(&connection_id, credentials)
        .await?;
    Ok(Json(connection))
}

async fn validate(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
) -> ApiResult<Json<ValidateResponse>> {
    let valid = state.engine.validate_connection(&connection_id).await?;
    Ok(Json(ValidateResponse { valid }))
}

async fn list_accounts(State(state): State<Arc<AppState>>) -> Json<Vec<BankAccount>> {
    Json(state.engine.accounts().await)
}

async fn disconnect_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.disconnect_account(&account_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn sync_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> ApiResult<Json<SyncOutcome>> {
    Ok(Json(state.engine.sync_account(&account_id).await?))
}

async fn summary(State(state): State<Arc<AppState>>) -> Json<AccountSummary> {
    Json(state.engine.get_account_summary().await)
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/connections", post(connect_account).get(list_connections))
        .route("/connections/{id}/reauth", post(reauthenticate))
        .route("/connections/{id}/validate", post(validate))
        .route("/accounts", get(list_accounts))
        .route("/accounts/{id}", delete(disconnect_account))
        .route("/accounts/{id}/sync", post(sync_account))
        .route("/summary", get(summary))
}
