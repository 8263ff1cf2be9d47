//! Connect, disconnect, validation and re-authentication.

use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BankingEngine, EngineState};
use crate::alerts::AlertType;
use crate::connections::{BankAccount, BankConnection, ConnectCredentials, ConnectionStatus};
use crate::errors::{Error, Result};
use crate::queue::QueueOperation;

impl BankingEngine {
    fn connect_lock(&self, institution_id: &str) -> Arc<Mutex<()>> {
        match self.connect_locks.lock() {
            Ok(mut locks) => locks
                .entry(institution_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
            Err(poisoned) => poisoned
                .into_inner()
                .entry(institution_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        }
    }

    /// Links an institution and runs the first ingestion for its accounts.
    ///
    /// Handshakes for the same institution are serialised; a caller that
    /// loses the race gets the connection the winner created. Nothing is
    /// stored when the handshake fails.
    pub async fn connect_account(
        &self,
        credentials: ConnectCredentials,
    ) -> Result<(BankConnection, Vec<BankAccount>)> {
        if credentials.institution_id.trim().is_empty() {
            return Err(Error::invalid_argument("institution id is required"));
        }
        let provider = self.provider_for(credentials.provider)?;

        let lock = self.connect_lock(&credentials.institution_id);
        let _connect_guard = lock.lock().await;

        {
            let state = self.state.lock().await;
            if let Some(existing) = state.connections.iter().find(|c| {
                c.institution_id == credentials.institution_id
                    && c.status == ConnectionStatus::Connected
            }) {
                debug!(
                    "[Connect] {} already connected as {}",
                    existing.institution_name, existing.id
                );
                let accounts = Self::accounts_of(&state, &existing.id);
                return Ok((existing.clone(), accounts));
            }
        }

        let now = self.now();
        let mut connection = BankConnection::new(
            Uuid::new_v4().to_string(),
            credentials.institution_id.clone(),
            credentials.institution_name.clone(),
            credentials.provider,
            now,
        );
        connection.transition(ConnectionStatus::Connecting, now)?;

        let link = match provider.connect(&credentials).await {
            Ok(link) => link,
            Err(err) => {
                warn!(
                    "[Connect] Handshake with {} failed: {}",
                    credentials.institution_name, err
                );
                return Err(err);
            }
        };
        self.authenticator
            .set_token(&connection.id, link.token.clone())
            .await?;

        let now = self.now();
        if !link.institution_name.trim().is_empty() {
            connection.institution_name = link.institution_name.clone();
        }
        connection.token_handle = Some(connection.id.clone());
        connection.token_expires_at = link.token.expires_at;
        connection.transition(ConnectionStatus::Connected, now)?;

        let accounts: Vec<BankAccount> = link
            .accounts
            .iter()
            .map(|acct| BankAccount {
                id: Uuid::new_v4().to_string(),
                connection_id: connection.id.clone(),
                provider_account_id: acct.provider_account_id.clone(),
                institution_name: connection.institution_name.clone(),
                name: acct.name.clone(),
                account_type: acct.account_type,
                masked_number: acct.masked_number.clone(),
                balance: acct.balance,
                currency: acct.currency.clone(),
                is_active: true,
                last_sync_at: None,
            })
            .collect();
        connection.account_ids = accounts.iter().map(|a| a.id.clone()).collect();

        info!(
            "[Connect] Connected {} with {} account(s)",
            connection.institution_name,
            accounts.len()
        );
        let connection_id = connection.id.clone();
        let account_ids = connection.account_ids.clone();
        {
            let mut state = self.state.lock().await;
            state.connections.push(connection);
            state.accounts.extend(accounts);
        }
        self.persist_or_warn().await;

        self.initial_sync(&account_ids).await;

        let state = self.state.lock().await;
        let connection = state
            .connection(&connection_id)
            .cloned()
            .ok_or_else(|| Error::invalid_state("connection vanished after connect"))?;
        let accounts = Self::accounts_of(&state, &connection_id);
        Ok((connection, accounts))
    }

    fn accounts_of(state: &EngineState, connection_id: &str) -> Vec<BankAccount> {
        state
            .accounts
            .iter()
            .filter(|a| a.connection_id == connection_id)
            .cloned()
            .collect()
    }

    /// First ingestion for freshly linked accounts. Deferred to the queue when
    /// a sync cycle is already running.
    async fn initial_sync(&self, account_ids: &[String]) {
        let Some(_sync_guard) = self.try_begin_sync() else {
            let now = self.now();
            {
                let mut state = self.state.lock().await;
                for account_id in account_ids {
                    let op = QueueOperation::Sync {
                        account_id: Some(account_id.clone()),
                    };
                    if let Err(err) = state.queue.enqueue(&op, now) {
                        warn!("[Queue] Could not defer initial sync: {}", err);
                    }
                }
            }
            debug!("[Connect] Sync in progress, initial ingestion queued");
            self.persist_or_warn().await;
            return;
        };

        let mut created = HashSet::new();
        let mut new_rows = 0;
        for account_id in account_ids {
            match self.ingest_account(account_id).await {
                Ok(summary) => new_rows += summary.new,
                Err(err) => self.handle_account_failure(account_id, err, &mut created).await,
            }
        }
        self.detect_duplicate_conflicts().await;
        if new_rows > 0 {
            if let Err(err) = self.auto_match_pass().await {
                warn!("[Reconcile] Initial match pass failed: {}", err);
            }
        }
        self.persist_or_warn().await;
    }

    /// Disconnects the connection owning `account_id`. Repeating it is a no-op.
    pub async fn disconnect_account(&self, account_id: &str) -> Result<()> {
        let connection = {
            let state = self.state.lock().await;
            let account = state
                .account(account_id)
                .ok_or_else(|| Error::invalid_argument(format!("unknown account {}", account_id)))?;
            let connection = state.connection(&account.connection_id).ok_or_else(|| {
                Error::invalid_state(format!("account {} has no connection", account_id))
            })?;
            if !account.is_active && connection.status == ConnectionStatus::Disconnected {
                return Ok(());
            }
            if connection.status != ConnectionStatus::Disconnected
                && !connection
                    .status
                    .can_transition_to(ConnectionStatus::Disconnected)
            {
                return Err(Error::invalid_state(format!(
                    "connection {} is {} and cannot be disconnected yet",
                    connection.id, connection.status
                )));
            }
            connection.clone()
        };

        match self.authenticator.get_token(&connection.id).await {
            Ok(Some(token)) => match self.provider_for(connection.provider) {
                Ok(provider) => {
                    if let Err(err) = provider.revoke(&token).await {
                        warn!(
                            "[Connect] Revoking token for {} failed: {}",
                            connection.institution_name, err
                        );
                    }
                }
                Err(err) => warn!("[Connect] {}", err),
            },
            Ok(None) => {}
            Err(err) => warn!("[Auth] Could not read token for {}: {}", connection.id, err),
        }
        if let Err(err) = self.authenticator.clear_token(&connection.id).await {
            warn!("[Auth] Could not clear token for {}: {}", connection.id, err);
        }

        {
            let now = self.now();
            let mut state = self.state.lock().await;
            if let Some(conn) = state.connection_mut(&connection.id) {
                conn.transition(ConnectionStatus::Disconnected, now)?;
                conn.token_handle = None;
                conn.token_expires_at = None;
            }
            let mut deactivated = Vec::new();
            for account in state
                .accounts
                .iter_mut()
                .filter(|a| a.connection_id == connection.id)
            {
                account.is_active = false;
                deactivated.push(account.id.clone());
            }
            let transaction_ids: Vec<String> = state
                .transactions
                .iter()
                .filter(|t| deactivated.contains(&t.account_id))
                .map(|t| t.id.clone())
                .collect();
            for id in transaction_ids {
                state.reconciliation.clear_pending(&id);
            }
        }
        info!("[Connect] Disconnected {}", connection.institution_name);
        self.persist_or_warn().await;
        Ok(())
    }

    /// Health check: a connected link needs a live token.
    pub async fn validate_connection(&self, connection_id: &str) -> Result<bool> {
        let status = {
            let state = self.state.lock().await;
            state
                .connection(connection_id)
                .map(|c| c.status)
                .ok_or_else(|| {
                    Error::invalid_argument(format!("unknown connection {}", connection_id))
                })?
        };
        if status != ConnectionStatus::Connected {
            return Ok(false);
        }

        let token = match self.authenticator.get_token(connection_id).await {
            Ok(token) => token,
            Err(err) => {
                warn!("[Auth] Token lookup for {} failed: {}", connection_id, err);
                return Ok(false);
            }
        };

        let now = self.now();
        let mut changed = false;
        let valid = {
            let mut state = self.state.lock().await;
            match token {
                None => {
                    if let Some(conn) = state.connection_mut(connection_id) {
                        conn.fail(ConnectionStatus::Error, "access token missing", now)?;
                        warn!("[Connect] {} has no access token", conn.institution_name);
                        changed = true;
                    }
                    false
                }
                Some(token) if token.is_expired(now) => {
                    let mut title = None;
                    if let Some(conn) = state.connection_mut(connection_id) {
                        conn.fail(ConnectionStatus::ReauthRequired, "access token expired", now)?;
                        title = Some((
                            EngineState::reauth_alert_title(conn),
                            conn.institution_name.clone(),
                        ));
                        changed = true;
                    }
                    if let Some((title, institution)) = title {
                        state.alert_once(
                            AlertType::AuthRequired,
                            &title,
                            format!("Access to {} expired. Sign in again to resume syncing.", institution),
                            now,
                        );
                    }
                    false
                }
                Some(_) => true,
            }
        };
        if changed {
            self.persist_or_warn().await;
        }
        Ok(valid)
    }

    /// Runs a new handshake for a connection that lost its authorisation.
    pub async fn reauthenticate_connection(
        &self,
        connection_id: &str,
        credentials: ConnectCredentials,
    ) -> Result<BankConnection> {
        let provider_kind = {
            let now = self.now();
            let mut state = self.state.lock().await;
            let conn = state.connection_mut(connection_id).ok_or_else(|| {
                Error::invalid_argument(format!("unknown connection {}", connection_id))
            })?;
            if !matches!(
                conn.status,
                ConnectionStatus::ReauthRequired | ConnectionStatus::Error
            ) {
                return Err(Error::invalid_state(format!(
                    "connection {} is {} and does not need re-authentication",
                    conn.id, conn.status
                )));
            }
            conn.transition(ConnectionStatus::Connecting, now)?;
            conn.provider
        };

        let outcome = match self.provider_for(provider_kind) {
            Ok(provider) => provider.connect(&credentials).await,
            Err(err) => Err(err),
        };
        let outcome = match outcome {
            Ok(link) => self
                .authenticator
                .set_token(connection_id, link.token.clone())
                .await
                .map(|_| link),
            Err(err) => Err(err),
        };

        let now = self.now();
        let (connection, account_ids) = {
            let mut state = self.state.lock().await;
            let conn = state.connection_mut(connection_id).ok_or_else(|| {
                Error::invalid_state(format!("connection {} vanished", connection_id))
            })?;
            match outcome {
                Ok(link) => {
                    conn.token_handle = Some(conn.id.clone());
                    conn.token_expires_at = link.token.expires_at;
                    conn.transition(ConnectionStatus::Connected, now)?;
                    let conn = conn.clone();
                    let title = EngineState::reauth_alert_title(&conn);
                    let unread: Vec<String> = state
                        .alerts
                        .unread_alerts()
                        .into_iter()
                        .filter(|a| a.alert_type == AlertType::AuthRequired && a.title == title)
                        .map(|a| a.id)
                        .collect();
                    for id in unread {
                        state.alerts.mark_alert_as_read(&id);
                    }
                    let account_ids: Vec<String> = state
                        .accounts
                        .iter()
                        .filter(|a| a.connection_id == conn.id && a.is_active)
                        .map(|a| a.id.clone())
                        .collect();
                    (conn, account_ids)
                }
                Err(err) => {
                    conn.fail(ConnectionStatus::Error, err.to_string(), now)?;
                    warn!(
                        "[Connect] Re-authentication for {} failed: {}",
                        conn.institution_name, err
                    );
                    drop(state);
                    self.persist_or_warn().await;
                    return Err(err);
                }
            }
        };
        info!("[Connect] Re-authenticated {}", connection.institution_name);
        self.persist_or_warn().await;

        self.initial_sync(&account_ids).await;
        Ok(self.connection(connection_id).await.unwrap_or(connection))
    }
}
