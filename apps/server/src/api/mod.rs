//! HTTP surface over [`bankfeed_core::BankingEngine`].

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::main_lib::AppState;

mod alerts;
mod connections;
mod reconcile;
mod sync;

async fn health() -> &'static str {
    "ok"
}

pub fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(connections::router())
        .merge(reconcile::router())
        .merge(sync::router())
        .merge(alerts::router())
        .with_state(state)
}
