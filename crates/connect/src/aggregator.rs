//! REST client for an account aggregator.

use async_trait::async_trait;
use bankfeed_core::auth::AccessToken;
use bankfeed_core::connections::{
    AccountActivity, BankProvider, ConnectCredentials, ProviderKind, ProviderLink,
};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;

use crate::error::{ConnectError, Result};
use crate::types::{ApiErrorResponse, CreateLinkRequest, CreateLinkResponse, TransactionsResponse};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

pub(crate) fn log_response(status: reqwest::StatusCode, body: &str) {
    if status.is_success() {
        debug!("[Connect] API response status: {}", status);
        return;
    }

    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    debug!("[Connect] API response error ({}): {}", status, preview);
}

/// Turns a non-success response into [`ConnectError::Api`], preferring the
/// structured error body when the service sent one.
pub(crate) fn error_from_body(status: reqwest::StatusCode, body: &str) -> ConnectError {
    if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(body) {
        return ConnectError::api(status.as_u16(), format!("{}: {}", error.code, error.message));
    }
    ConnectError::api(status.as_u16(), format!("Request failed: {}", body))
}

pub(crate) async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;
    log_response(status, &body);

    if !status.is_success() {
        return Err(error_from_body(status, &body));
    }
    Ok(serde_json::from_str(&body)?)
}

pub(crate) fn build_http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .build()?)
}

/// Aggregator-backed [`BankProvider`].
///
/// Bearer tokens issued by `POST /v1/links` authorise the per-account
/// transaction reads and the final revoke.
#[derive(Debug, Clone)]
pub struct AggregatorClient {
    client: reqwest::Client,
    base_url: String,
    kind: ProviderKind,
}

impl AggregatorClient {
    /// # Arguments
    ///
    /// * `base_url` - The base URL of the aggregator (e.g., "https://api.aggregator.example")
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            kind: ProviderKind::Aggregator,
        })
    }

    /// Registers the client under another provider kind, e.g. an open
    /// banking gateway exposing the same API.
    pub fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self, token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ConnectError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);
        Ok(headers)
    }

    fn transactions_url(&self, provider_account_id: &str) -> String {
        format!(
            "{}/v1/accounts/{}/transactions",
            self.base_url, provider_account_id
        )
    }

    /// POST /v1/links
    pub async fn create_link(&self, credentials: &ConnectCredentials) -> Result<CreateLinkResponse> {
        let url = format!("{}/v1/links", self.base_url);
        debug!("[Connect] Creating link for institution {}", credentials.institution_id);

        let request = CreateLinkRequest {
            institution_id: credentials.institution_id.clone(),
            institution_name: credentials.institution_name.clone(),
            username: credentials.username.clone(),
            secret: credentials.secret.clone(),
        };
        let response = self.client.post(&url).json(&request).send().await?;
        parse_response(response).await
    }

    /// GET /v1/accounts/{id}/transactions?since=...
    pub async fn list_transactions(
        &self,
        token: &str,
        provider_account_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<TransactionsResponse> {
        let mut request = self
            .client
            .get(self.transactions_url(provider_account_id))
            .headers(self.headers(token)?);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339_opts(SecondsFormat::Secs, true))]);
        }
        parse_response(request.send().await?).await
    }

    /// POST /v1/links/revoke
    pub async fn revoke_link(&self, token: &str) -> Result<()> {
        let url = format!("{}/v1/links/revoke", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers(token)?)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await?;
        log_response(status, &body);
        Err(error_from_body(status, &body))
    }
}

#[async_trait]
impl BankProvider for AggregatorClient {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn connect(&self, credentials: &ConnectCredentials) -> bankfeed_core::Result<ProviderLink> {
        let link = self.create_link(credentials).await?;
        info!(
            "[Connect] Aggregator linked {} with {} account(s)",
            link.institution_name,
            link.accounts.len()
        );

        let mut token = AccessToken::new(link.access_token);
        token.refresh_token = link.refresh_token;
        token.expires_at = link.expires_at;
        Ok(ProviderLink {
            institution_id: link.institution_id,
            institution_name: link.institution_name,
            token,
            accounts: link.accounts,
        })
    }

    async fn fetch_transactions(
        &self,
        token: &AccessToken,
        provider_account_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> bankfeed_core::Result<AccountActivity> {
        let page = self
            .list_transactions(&token.access_token, provider_account_id, since)
            .await?;
        Ok(AccountActivity {
            balance: page.balance,
            transactions: page.transactions,
        })
    }

    async fn revoke(&self, token: &AccessToken) -> bankfeed_core::Result<()> {
        Ok(self.revoke_link(&token.access_token).await?)
    }
}
