//! Contract for institution-integration providers.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{AccountType, ConnectCredentials, ProviderKind};
use crate::auth::AccessToken;
use crate::errors::Result;

/// Account as reported by the provider during a handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAccount {
    pub provider_account_id: String,
    pub name: String,
    pub account_type: AccountType,
    pub masked_number: String,
    pub balance: Decimal,
    pub currency: String,
}

/// Result of a successful connect or reauth handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderLink {
    pub institution_id: String,
    pub institution_name: String,
    pub token: AccessToken,
    pub accounts: Vec<ProviderAccount>,
}

/// Transaction row as delivered by a provider, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    #[serde(default)]
    pub provider_transaction_id: String,
    pub amount: Decimal,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub original_description: Option<String>,
    #[serde(default)]
    pub merchant_name: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub date: NaiveDate,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub payment_channel: Option<String>,
}

/// Fetch result for one account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountActivity {
    pub balance: Option<Decimal>,
    pub transactions: Vec<RawTransaction>,
}

/// An institution integration (aggregator, open banking, sandbox).
///
/// Implementations map their own failures onto [`crate::Error::AuthFailed`]
/// and [`crate::Error::ProviderUnavailable`]; timeouts are unavailability.
#[async_trait]
pub trait BankProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Runs the credential handshake. Also used for re-authentication.
    async fn connect(&self, credentials: &ConnectCredentials) -> Result<ProviderLink>;

    async fn fetch_transactions(
        &self,
        token: &AccessToken,
        provider_account_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<AccountActivity>;

    async fn revoke(&self, token: &AccessToken) -> Result<()>;
}
