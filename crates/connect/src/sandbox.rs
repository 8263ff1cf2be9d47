//! Deterministic in-process provider serving a single "Demo Bank".

use async_trait::async_trait;
use bankfeed_core::auth::AccessToken;
use bankfeed_core::connections::{
    AccountActivity, AccountType, BankProvider, ConnectCredentials, ProviderAccount,
    ProviderKind, ProviderLink, RawTransaction,
};
use bankfeed_core::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use log::debug;
use rust_decimal_macros::dec;

pub const DEMO_BANK_ID: &str = "demo-bank";
pub const DEMO_BANK_NAME: &str = "Demo Bank";

const DEMO_CHECKING_ID: &str = "demo-checking";
const TOKEN_PREFIX: &str = "sandbox-";
/// Secret that makes the handshake fail, for exercising the auth path.
const REJECTED_SECRET: &str = "invalid";

/// Sandbox [`BankProvider`]. Every call returns the same data for the same
/// reference date; there is no randomness and no network.
#[derive(Debug, Clone)]
pub struct SandboxProvider {
    reference_date: NaiveDate,
}

impl SandboxProvider {
    /// Demo activity dated today (UTC).
    pub fn new() -> Self {
        Self::with_reference_date(Utc::now().date_naive())
    }

    /// Demo activity dated `reference_date`.
    pub fn with_reference_date(reference_date: NaiveDate) -> Self {
        Self { reference_date }
    }

    pub fn reference_date(&self) -> NaiveDate {
        self.reference_date
    }

    fn demo_accounts() -> Vec<ProviderAccount> {
        vec![ProviderAccount {
            provider_account_id: DEMO_CHECKING_ID.to_string(),
            name: "Everyday Checking".to_string(),
            account_type: AccountType::Checking,
            masked_number: "****1234".to_string(),
            balance: dec!(2500.00),
            currency: "USD".to_string(),
        }]
    }

    fn demo_transactions(&self) -> Vec<RawTransaction> {
        vec![RawTransaction {
            provider_transaction_id: "demo-txn-0001".to_string(),
            amount: dec!(-25.99),
            description: "STARBUCKS #123".to_string(),
            original_description: Some("STARBUCKS #123".to_string()),
            merchant_name: Some("Starbucks".to_string()),
            categories: vec!["Food and Drink".to_string(), "Coffee Shop".to_string()],
            date: self.reference_date,
            pending: false,
            payment_channel: Some("in store".to_string()),
        }]
    }

    fn check_token(token: &AccessToken) -> Result<()> {
        if token.access_token.starts_with(TOKEN_PREFIX) {
            Ok(())
        } else {
            Err(Error::auth_failed("sandbox token not recognised"))
        }
    }
}

impl Default for SandboxProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BankProvider for SandboxProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Sandbox
    }

    async fn connect(&self, credentials: &ConnectCredentials) -> Result<ProviderLink> {
        if credentials.institution_id != DEMO_BANK_ID {
            return Err(Error::invalid_argument(format!(
                "sandbox does not know institution {}",
                credentials.institution_id
            )));
        }
        if credentials.secret == REJECTED_SECRET {
            return Err(Error::auth_failed("sandbox rejected the credentials"));
        }

        debug!("[Connect] Sandbox handshake for {}", credentials.username);
        Ok(ProviderLink {
            institution_id: DEMO_BANK_ID.to_string(),
            institution_name: DEMO_BANK_NAME.to_string(),
            token: AccessToken::new(format!("{}{}", TOKEN_PREFIX, credentials.username)),
            accounts: Self::demo_accounts(),
        })
    }

    async fn fetch_transactions(
        &self,
        token: &AccessToken,
        provider_account_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<AccountActivity> {
        Self::check_token(token)?;
        if provider_account_id != DEMO_CHECKING_ID {
            return Err(Error::invalid_argument(format!(
                "sandbox has no account {}",
                provider_account_id
            )));
        }

        let cutoff = since.map(|s| s.date_naive());
        let transactions = self
            .demo_transactions()
            .into_iter()
            .filter(|t| cutoff.map_or(true, |c| t.date >= c))
            .collect();
        Ok(AccountActivity {
            balance: Some(dec!(2500.00)),
            transactions,
        })
    }

    async fn revoke(&self, token: &AccessToken) -> Result<()> {
        Self::check_token(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(secret: &str) -> ConnectCredentials {
        ConnectCredentials {
            institution_id: DEMO_BANK_ID.to_string(),
            institution_name: DEMO_BANK_NAME.to_string(),
            provider: ProviderKind::Sandbox,
            username: "user_good".to_string(),
            secret: secret.to_string(),
        }
    }

    fn march_first() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[tokio::test]
    async fn handshake_returns_one_checking_account() {
        let provider = SandboxProvider::with_reference_date(march_first());
        let link = provider.connect(&credentials("pass_good")).await.unwrap();

        assert_eq!(link.institution_name, "Demo Bank");
        assert_eq!(link.accounts.len(), 1);
        assert_eq!(link.accounts[0].account_type, AccountType::Checking);
        assert_eq!(link.accounts[0].balance, dec!(2500.00));
        assert_eq!(link.token.access_token, "sandbox-user_good");
    }

    #[tokio::test]
    async fn rejected_secret_is_an_auth_failure() {
        let provider = SandboxProvider::with_reference_date(march_first());
        let err = provider.connect(&credentials("invalid")).await.unwrap_err();
        assert!(matches!(err, Error::AuthFailed(_)));
    }

    #[tokio::test]
    async fn unknown_institution_is_rejected() {
        let provider = SandboxProvider::with_reference_date(march_first());
        let mut creds = credentials("pass_good");
        creds.institution_id = "other-bank".to_string();
        let err = provider.connect(&creds).await.unwrap_err();
        assert!(err.is_caller_error());
    }

    #[tokio::test]
    async fn activity_is_stable_across_calls() {
        let provider = SandboxProvider::with_reference_date(march_first());
        let token = AccessToken::new("sandbox-user_good");

        let first = provider
            .fetch_transactions(&token, DEMO_CHECKING_ID, None)
            .await
            .unwrap();
        let second = provider
            .fetch_transactions(&token, DEMO_CHECKING_ID, None)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.transactions.len(), 1);
        assert_eq!(first.transactions[0].amount, dec!(-25.99));
        assert_eq!(first.transactions[0].date, march_first());
    }

    #[tokio::test]
    async fn since_after_reference_date_returns_nothing_new() {
        let provider = SandboxProvider::with_reference_date(march_first());
        let token = AccessToken::new("sandbox-user_good");
        let since = "2024-03-02T00:00:00Z".parse::<DateTime<Utc>>().unwrap();

        let activity = provider
            .fetch_transactions(&token, DEMO_CHECKING_ID, Some(since))
            .await
            .unwrap();
        assert!(activity.transactions.is_empty());
        assert_eq!(activity.balance, Some(dec!(2500.00)));
    }

    #[tokio::test]
    async fn foreign_token_is_refused() {
        let provider = SandboxProvider::with_reference_date(march_first());
        let err = provider
            .fetch_transactions(&AccessToken::new("agg-abc"), DEMO_CHECKING_ID, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailed(_)));
    }
}
