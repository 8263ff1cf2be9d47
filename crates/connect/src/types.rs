//! Wire types for the aggregator and expense service APIs.

use bankfeed_core::connections::{ProviderAccount, RawTransaction};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Error body returned by both services on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    pub code: String,
    pub message: String,
}

/// POST /v1/links
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLinkRequest {
    pub institution_id: String,
    pub institution_name: String,
    pub username: String,
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLinkResponse {
    pub institution_id: String,
    pub institution_name: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub accounts: Vec<ProviderAccount>,
}

/// GET /v1/accounts/{id}/transactions
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionsResponse {
    #[serde(default)]
    pub balance: Option<Decimal>,
    #[serde(default)]
    pub transactions: Vec<RawTransaction>,
}
