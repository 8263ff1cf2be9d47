//! Institution connection and bank account models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{Error, Result};

/// Lifecycle status of a [`BankConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Error,
    ReauthRequired,
    Disconnected,
}

impl ConnectionStatus {
    /// Allowed edges of the connection state machine.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Disconnected)
                | (Connected, ReauthRequired)
                | (Connected, Error)
                | (ReauthRequired, Connecting)
                | (ReauthRequired, Disconnected)
                | (Error, Connecting)
                | (Error, Disconnected)
        )
    }

    /// No further automatic action is taken from these states.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::Disconnected | ConnectionStatus::Error)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::ReauthRequired => "reauth_required",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Integration family behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Aggregator,
    OpenBanking,
    Sandbox,
}

/// One link to a financial institution. Never deleted; disconnect is a status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankConnection {
    pub id: String,
    pub institution_id: String,
    pub institution_name: String,
    pub provider: ProviderKind,
    pub status: ConnectionStatus,
    pub account_ids: Vec<String>,
    /// Name under which the Authenticator keeps the token. The token itself is never stored here.
    pub token_handle: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl BankConnection {
    pub fn new(
        id: impl Into<String>,
        institution_id: impl Into<String>,
        institution_name: impl Into<String>,
        provider: ProviderKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            institution_id: institution_id.into(),
            institution_name: institution_name.into(),
            provider,
            status: ConnectionStatus::Idle,
            account_ids: Vec::new(),
            token_handle: None,
            token_expires_at: None,
            created_at: now,
            updated_at: now,
            last_sync_at: None,
            last_error: None,
        }
    }

    /// Moves the connection along the state machine, rejecting illegal edges.
    pub fn transition(&mut self, next: ConnectionStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "connection {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        if next == ConnectionStatus::Connected {
            self.last_error = None;
        }
        Ok(())
    }

    /// Transition into a failure state, recording the reason.
    pub fn fail(
        &mut self,
        next: ConnectionStatus,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(next, now)?;
        self.last_error = Some(reason.into());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Checking,
    Savings,
    Credit,
    Investment,
}

/// One account under a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankAccount {
    pub id: String,
    pub connection_id: String,
    pub provider_account_id: String,
    pub institution_name: String,
    pub name: String,
    pub account_type: AccountType,
    pub masked_number: String,
    pub balance: Decimal,
    pub currency: String,
    pub is_active: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Credentials handed to a provider handshake.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectCredentials {
    pub institution_id: String,
    pub institution_name: String,
    pub provider: ProviderKind,
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for ConnectCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectCredentials")
            .field("institution_id", &self.institution_id)
            .field("institution_name", &self.institution_name)
            .field("provider", &self.provider)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Aggregated view over active accounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub balances_by_currency: BTreeMap<String, Decimal>,
    pub active_accounts: usize,
    pub connected_institutions: usize,
    pub connections_needing_attention: usize,
    pub unmatched_transactions: usize,
    pub pending_matches: usize,
    pub open_conflicts: usize,
    pub unread_alerts: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
}
