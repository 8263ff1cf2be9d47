//! Transaction listing, reconciliation and conflict endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bankfeed_core::reconciliation::{ConflictResolution, MatchSuggestion, ReconciliationConflict};
use bankfeed_core::transactions::{BankTransaction, ReconciliationStatus};
use bankfeed_core::OperationOutcome;
use serde::Deserialize;

use crate::error::ApiResult;
use crate::main_lib::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFilter {
    pub status: Option<ReconciliationStatus>,
    pub account_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    /// `None` records a new expense from the transaction.
    #[serde(default)]
    pub expense_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub resolution: ConflictResolution,
}

async fn list_transactions(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<TransactionFilter>,
) -> Json<Vec<BankTransaction>> {
    let transactions = state
        .engine
        .transactions()
        .await
        .into_iter()
        .filter(|t| filter.status.map_or(true, |s| t.reconciliation_status == s))
        .filter(|t| {
            filter
                .account_id
                .as_deref()
                .map_or(true, |id| t.account_id == id)
        })
        .collect();
    Json(transactions)
}

async fn reconcile(
    State(state): State<Arc<AppState>>,
    Path(transaction_id): Path<String>,
    Json(request): Json<ReconcileRequest>,
) -> ApiResult<Json<OperationOutcome>> {
    let outcome = state
        .engine
        .reconcile_transaction(&transaction_id, request.expense_id.as_deref())
        .await?;
    Ok(Json(outcome))
}

async fn ignore(
    State(state): State<Arc<AppState>>,
    Path(transaction_id): Path<String>,
) -> ApiResult<Json<OperationOutcome>> {
    Ok(Json(
        state
            .engine
            .mark_transaction_as_ignored(&transaction_id)
            .await?,
    ))
}

async fn suggestions(
    State(state): State<Arc<AppState>>,
    Path(transaction_id): Path<String>,
) -> ApiResult<Json<Vec<MatchSuggestion>>> {
    Ok(Json(state.engine.suggest_matches(&transaction_id).await?))
}

async fn list_conflicts(State(state): State<Arc<AppState>>) -> Json<Vec<ReconciliationConflict>> {
    Json(state.engine.reconciliation_state().await.conflicts_to_resolve)
}

async fn resolve_conflict(
    State(state): State<Arc<AppState>>,
    Path(conflict_id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .resolve_conflict(&conflict_id, request.resolution)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/transactions", get(list_transactions))
        .route("/transactions/{id}/reconcile", post(reconcile))
        .route("/transactions/{id}/ignore", post(ignore))
        .route("/transactions/{id}/suggestions", get(suggestions))
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/{id}/resolve", post(resolve_conflict))
}
