//! The banking engine: owns all domain state and serialises every mutation.
//!
//! State lives behind one async mutex. The lock is only held for in-memory
//! work and is always released before calling the provider, the
//! authenticator, the expense ledger or the repository. A single
//! `is_syncing` flag keeps sync cycles and queue drains from overlapping.
//! Saves are serialised by their own lock so snapshots land in order.

mod connection_ops;
mod queue_ops;
mod reconcile_ops;
mod sync_cycle;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::alerts::{AlertCenter, AlertType, SyncAlert};
use crate::auth::Authenticator;
use crate::clock::{Clock, SystemClock};
use crate::connections::{
    AccountSummary, BankAccount, BankConnection, BankProvider, ConnectionStatus, ProviderKind,
};
use crate::errors::{Error, Result};
use crate::persistence::{EngineRepository, EngineSnapshot};
use crate::queue::{OperationQueue, TransactionQueueItem};
use crate::reconciliation::{ExpenseLedger, ReconciliationState};
use crate::sync::{
    AppLifecycle, SkipReason, SyncConfig, SyncConfigUpdate, SyncOutcome, SyncStats, SyncTrigger,
    FOREGROUND_SYNC_THRESHOLD_MINUTES,
};
use crate::transactions::{BankTransaction, ReconciliationStatus};

/// Result of a user mutation that may have been deferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum OperationOutcome {
    Applied,
    Queued {
        #[serde(rename = "itemId")]
        item_id: String,
    },
}

/// In-memory domain state.
#[derive(Debug, Default)]
struct EngineState {
    accounts: Vec<BankAccount>,
    transactions: Vec<BankTransaction>,
    connections: Vec<BankConnection>,
    sync_config: SyncConfig,
    sync_stats: SyncStats,
    reconciliation: ReconciliationState,
    alerts: AlertCenter,
    queue: OperationQueue,
}

impl EngineState {
    fn from_snapshot(snapshot: EngineSnapshot) -> Self {
        Self {
            accounts: snapshot.accounts,
            transactions: snapshot.transactions,
            connections: snapshot.connections,
            sync_config: snapshot.sync_config,
            sync_stats: snapshot.sync_stats,
            reconciliation: snapshot.reconciliation_state,
            alerts: AlertCenter::from_persisted(snapshot.alerts),
            queue: OperationQueue::from_persisted(snapshot.transaction_queue),
        }
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            accounts: self.accounts.clone(),
            transactions: self.transactions.clone(),
            connections: self.connections.clone(),
            sync_config: self.sync_config.clone(),
            sync_stats: self.sync_stats.clone(),
            reconciliation_state: self.reconciliation.clone(),
            alerts: self.alerts.persisted(),
            transaction_queue: self.queue.persisted(),
        }
    }

    fn account(&self, account_id: &str) -> Option<&BankAccount> {
        self.accounts.iter().find(|a| a.id == account_id)
    }

    fn connection(&self, connection_id: &str) -> Option<&BankConnection> {
        self.connections.iter().find(|c| c.id == connection_id)
    }

    fn connection_mut(&mut self, connection_id: &str) -> Option<&mut BankConnection> {
        self.connections.iter_mut().find(|c| c.id == connection_id)
    }

    fn transaction(&self, transaction_id: &str) -> Option<&BankTransaction> {
        self.transactions.iter().find(|t| t.id == transaction_id)
    }

    fn transaction_mut(&mut self, transaction_id: &str) -> Option<&mut BankTransaction> {
        self.transactions.iter_mut().find(|t| t.id == transaction_id)
    }

    /// Expense ids already linked, skipping one transaction.
    fn claimed_expense_ids(&self, except_transaction_id: Option<&str>) -> HashSet<String> {
        self.transactions
            .iter()
            .filter(|t| Some(t.id.as_str()) != except_transaction_id)
            .filter_map(|t| t.expense_id.clone())
            .collect()
    }

    /// Raises an alert unless an unread one with the same type and title exists.
    fn alert_once(
        &mut self,
        alert_type: AlertType,
        title: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.alerts.has_unread(alert_type, title) {
            return false;
        }
        self.alerts.add_alert(alert_type, title, message, now);
        true
    }

    fn reauth_alert_title(connection: &BankConnection) -> String {
        format!("Reconnect {}", connection.institution_name)
    }
}

/// Resets `is_syncing` when a cycle ends, however it ends.
struct SyncGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct BankingEngine {
    providers: HashMap<ProviderKind, Arc<dyn BankProvider>>,
    authenticator: Arc<dyn Authenticator>,
    ledger: Arc<dyn ExpenseLedger>,
    repository: Arc<dyn EngineRepository>,
    clock: Arc<dyn Clock>,
    state: Mutex<EngineState>,
    is_syncing: AtomicBool,
    persist_lock: Mutex<()>,
    connect_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    backgrounded_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl BankingEngine {
    pub fn new(
        provider: Arc<dyn BankProvider>,
        authenticator: Arc<dyn Authenticator>,
        ledger: Arc<dyn ExpenseLedger>,
        repository: Arc<dyn EngineRepository>,
    ) -> Self {
        let mut providers: HashMap<ProviderKind, Arc<dyn BankProvider>> = HashMap::new();
        providers.insert(provider.kind(), provider);
        Self {
            providers,
            authenticator,
            ledger,
            repository,
            clock: Arc::new(SystemClock),
            state: Mutex::new(EngineState::default()),
            is_syncing: AtomicBool::new(false),
            persist_lock: Mutex::new(()),
            connect_locks: std::sync::Mutex::new(HashMap::new()),
            backgrounded_at: std::sync::Mutex::new(None),
        }
    }

    /// Registers an additional provider for its kind.
    pub fn with_provider(mut self, provider: Arc<dyn BankProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn provider_for(&self, kind: ProviderKind) -> Result<Arc<dyn BankProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::invalid_argument(format!("no provider registered for {:?}", kind)))
    }

    fn try_begin_sync(&self) -> Option<SyncGuard<'_>> {
        self.is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SyncGuard {
                flag: &self.is_syncing,
            })
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Replaces in-memory state with what the repository holds.
    pub async fn restore(&self) -> Result<()> {
        let snapshot = self.repository.load().await?;
        let mut state = self.state.lock().await;
        *state = EngineState::from_snapshot(snapshot);
        debug!(
            "[Storage] Restored {} connection(s), {} queued item(s)",
            state.connections.len(),
            state.queue.items().len()
        );
        Ok(())
    }

    /// Writes the persisted subset. The state lock is released before saving;
    /// the persist lock is held across snapshot and save.
    pub async fn persist(&self) -> Result<()> {
        let _persisting = self.persist_lock.lock().await;
        let snapshot = {
            let state = self.state.lock().await;
            state.snapshot()
        };
        self.repository.save(&snapshot).await
    }

    /// Persists and logs instead of failing: in-memory state stays authoritative.
    async fn persist_or_warn(&self) {
        if let Err(err) = self.persist().await {
            warn!("[Storage] Failed to persist engine state: {}", err);
        }
    }

    // Read snapshots

    pub async fn accounts(&self) -> Vec<BankAccount> {
        self.state.lock().await.accounts.clone()
    }

    pub async fn connections(&self) -> Vec<BankConnection> {
        self.state.lock().await.connections.clone()
    }

    pub async fn connection(&self, connection_id: &str) -> Option<BankConnection> {
        self.state.lock().await.connection(connection_id).cloned()
    }

    pub async fn transactions(&self) -> Vec<BankTransaction> {
        self.state.lock().await.transactions.clone()
    }

    pub async fn transaction(&self, transaction_id: &str) -> Option<BankTransaction> {
        self.state.lock().await.transaction(transaction_id).cloned()
    }

    pub async fn sync_config(&self) -> SyncConfig {
        self.state.lock().await.sync_config.clone()
    }

    pub async fn sync_stats(&self) -> SyncStats {
        self.state.lock().await.sync_stats.clone()
    }

    pub async fn reconciliation_state(&self) -> ReconciliationState {
        self.state.lock().await.reconciliation.clone()
    }

    pub async fn queue_items(&self) -> Vec<TransactionQueueItem> {
        self.state.lock().await.queue.items().to_vec()
    }

    pub async fn alerts(&self) -> Vec<SyncAlert> {
        self.state.lock().await.alerts.all()
    }

    // Alerts

    pub async fn get_unread_alerts(&self) -> Vec<SyncAlert> {
        self.state.lock().await.alerts.unread_alerts()
    }

    pub async fn mark_alert_as_read(&self, alert_id: &str) -> Result<()> {
        let found = self.state.lock().await.alerts.mark_alert_as_read(alert_id);
        if !found {
            return Err(Error::invalid_argument(format!("unknown alert {}", alert_id)));
        }
        self.persist_or_warn().await;
        Ok(())
    }

    pub async fn clear_alerts(&self) {
        self.state.lock().await.alerts.clear_alerts();
        self.persist_or_warn().await;
    }

    // Configuration

    pub async fn update_sync_config(&self, update: SyncConfigUpdate) -> Result<SyncConfig> {
        let config = {
            let mut state = self.state.lock().await;
            state.sync_config.apply(update)?;
            state.sync_config.clone()
        };
        debug!(
            "[Sync] Config updated: auto_sync={} interval={}m max_retries={}",
            config.auto_sync, config.sync_interval_minutes, config.max_retries
        );
        self.persist_or_warn().await;
        Ok(config)
    }

    /// Balances reported by the provider, summed per currency over active accounts.
    pub async fn get_account_summary(&self) -> AccountSummary {
        let state = self.state.lock().await;
        let mut summary = AccountSummary {
            balances_by_currency: Default::default(),
            active_accounts: 0,
            connected_institutions: 0,
            connections_needing_attention: 0,
            unmatched_transactions: 0,
            pending_matches: state.reconciliation.pending_matches.len(),
            open_conflicts: state.reconciliation.conflicts_to_resolve.len(),
            unread_alerts: state.alerts.unread_count(),
            last_sync_at: state.sync_stats.last_sync_at,
        };

        for account in state.accounts.iter().filter(|a| a.is_active) {
            summary.active_accounts += 1;
            *summary
                .balances_by_currency
                .entry(account.currency.clone())
                .or_default() += account.balance;
        }

        let institutions: BTreeSet<&str> = state
            .connections
            .iter()
            .filter(|c| c.status == ConnectionStatus::Connected)
            .map(|c| c.institution_id.as_str())
            .collect();
        summary.connected_institutions = institutions.len();
        summary.connections_needing_attention = state
            .connections
            .iter()
            .filter(|c| {
                matches!(
                    c.status,
                    ConnectionStatus::ReauthRequired | ConnectionStatus::Error
                )
            })
            .count();

        let active_ids: HashSet<&str> = state
            .accounts
            .iter()
            .filter(|a| a.is_active)
            .map(|a| a.id.as_str())
            .collect();
        summary.unmatched_transactions = state
            .transactions
            .iter()
            .filter(|t| t.reconciliation_status == ReconciliationStatus::Unmatched)
            .filter(|t| active_ids.contains(t.account_id.as_str()))
            .count();

        summary
    }

    // Lifecycle

    /// Foreground after a long background stint syncs; any other return drains the queue.
    pub async fn handle_app_state_change(&self, lifecycle: AppLifecycle) -> Option<SyncOutcome> {
        let now = self.now();
        match lifecycle {
            AppLifecycle::Background => {
                if let Ok(mut backgrounded_at) = self.backgrounded_at.lock() {
                    *backgrounded_at = Some(now);
                }
                debug!("[Sync] App moved to background");
                None
            }
            AppLifecycle::Active => {
                let backgrounded_at = self
                    .backgrounded_at
                    .lock()
                    .ok()
                    .and_then(|mut guard| guard.take());
                let long_absence = backgrounded_at.is_some_and(|since| {
                    now - since > Duration::minutes(FOREGROUND_SYNC_THRESHOLD_MINUTES)
                });

                if long_absence {
                    let outcome = self.trigger_sync(SyncTrigger::Foreground).await;
                    if matches!(outcome, SyncOutcome::Skipped(SkipReason::AutoSyncDisabled)) {
                        self.drain_queue().await;
                    }
                    return Some(outcome);
                }
                if !self.is_syncing() {
                    self.drain_queue().await;
                }
                None
            }
        }
    }
}
