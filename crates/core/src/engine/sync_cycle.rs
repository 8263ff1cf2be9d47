//! Sync cycle: auth check, health validation, ingestion, matching, queue drain.

use log::{debug, info, warn};
use std::collections::HashSet;
use std::time::Instant;

use super::{BankingEngine, EngineState};
use crate::alerts::AlertType;
use crate::connections::ConnectionStatus;
use crate::errors::{Error, Result, RetryClass};
use crate::queue::QueueOperation;
use crate::reconciliation::{candidate_query, detect_duplicates, rank_candidates, select_auto_match};
use crate::sync::{should_run, SkipReason, SyncCycleResult, SyncCycleStatus, SyncOutcome, SyncTrigger};
use crate::transactions::{ingest_batch, BankTransaction};

const SIGN_IN_ALERT_TITLE: &str = "Sign in required";
const DUPLICATE_ALERT_TITLE: &str = "Possible duplicate transactions";

/// Counts from one account's ingestion.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct IngestSummary {
    pub seen: usize,
    pub new: usize,
    pub duplicates: usize,
}

impl BankingEngine {
    /// Starts a cycle unless one is running or the trigger's policy says no.
    pub async fn trigger_sync(&self, trigger: SyncTrigger) -> SyncOutcome {
        let Some(_sync_guard) = self.try_begin_sync() else {
            debug!("[Sync] {:?} trigger ignored, a sync is already running", trigger);
            return SyncOutcome::Skipped(SkipReason::AlreadySyncing);
        };

        let (config, last_successful) = {
            let state = self.state.lock().await;
            (
                state.sync_config.clone(),
                state.sync_stats.last_successful_sync_at,
            )
        };
        if let Some(reason) = should_run(trigger, &config, last_successful, self.now()) {
            debug!("[Sync] {:?} trigger skipped: {:?}", trigger, reason);
            return SyncOutcome::Skipped(reason);
        }

        SyncOutcome::Completed(self.run_cycle(trigger, None).await)
    }

    pub async fn sync_all_accounts(&self) -> SyncOutcome {
        self.trigger_sync(SyncTrigger::Manual).await
    }

    /// Manual sync restricted to one active account.
    pub async fn sync_account(&self, account_id: &str) -> Result<SyncOutcome> {
        {
            let state = self.state.lock().await;
            let account = state
                .account(account_id)
                .ok_or_else(|| Error::invalid_argument(format!("unknown account {}", account_id)))?;
            if !account.is_active {
                return Err(Error::invalid_state(format!(
                    "account {} is disconnected",
                    account_id
                )));
            }
        }

        let Some(_sync_guard) = self.try_begin_sync() else {
            return Ok(SyncOutcome::Skipped(SkipReason::AlreadySyncing));
        };
        Ok(SyncOutcome::Completed(
            self.run_cycle(SyncTrigger::Manual, Some(account_id.to_string()))
                .await,
        ))
    }

    /// Runs a full cycle. The caller holds the sync guard.
    async fn run_cycle(&self, trigger: SyncTrigger, scope: Option<String>) -> SyncCycleResult {
        let timer = Instant::now();
        let mut result = SyncCycleResult::new(trigger, self.now());
        let mut created = HashSet::new();

        if let Err(err) = self
            .run_sync_steps(scope.as_deref(), &mut result, &mut created)
            .await
        {
            warn!("[Sync] Cycle failed, queued for retry: {}", err);
            result.status = SyncCycleStatus::Failed;
            result.error = Some(err.to_string());
            let now = self.now();
            let mut state = self.state.lock().await;
            match state.queue.enqueue(&QueueOperation::Sync { account_id: scope }, now) {
                Ok(item_id) => {
                    created.insert(item_id);
                }
                Err(enqueue_err) => warn!("[Queue] Could not queue failed cycle: {}", enqueue_err),
            }
        }

        if result.status != SyncCycleStatus::NotAuthenticated {
            result.queue = self.drain_queue_excluding(&created, true).await;
            result.accounts_synced += result.queue.accounts_synced;
            result.new_transactions += result.queue.new_transactions;
        }

        result.duration_ms = i64::try_from(timer.elapsed().as_millis()).unwrap_or(i64::MAX);
        {
            let now = self.now();
            let mut state = self.state.lock().await;
            state
                .sync_stats
                .record_cycle(result.status, result.duration_ms, now);
            if result.status == SyncCycleStatus::Ok {
                state.sync_config.failed_attempts = 0;
            }
        }
        self.persist_or_warn().await;

        info!(
            "[Sync] {:?} cycle {:?} in {}ms: {} account(s) synced, {} failed, {} new, {} matched, queue {}/{} done",
            result.trigger,
            result.status,
            result.duration_ms,
            result.accounts_synced,
            result.accounts_failed,
            result.new_transactions,
            result.auto_matched,
            result.queue.completed,
            result.queue.processed
        );
        result
    }

    /// Cycle body without the queue drain. Also used by queued whole-cycle retries.
    pub(super) async fn run_sync_steps(
        &self,
        scope: Option<&str>,
        result: &mut SyncCycleResult,
        created: &mut HashSet<String>,
    ) -> Result<()> {
        if !self.authenticator.is_authenticated().await? {
            let now = self.now();
            let mut state = self.state.lock().await;
            state.alert_once(
                AlertType::AuthRequired,
                SIGN_IN_ALERT_TITLE,
                "Sign in to resume syncing your bank accounts.",
                now,
            );
            result.status = SyncCycleStatus::NotAuthenticated;
            debug!("[Sync] Not authenticated, cycle stopped");
            return Ok(());
        }

        let connection_ids: Vec<String> = {
            let state = self.state.lock().await;
            let scoped_connection = scope
                .and_then(|account_id| state.account(account_id))
                .map(|a| a.connection_id.clone());
            state
                .connections
                .iter()
                .filter(|c| c.status == ConnectionStatus::Connected)
                .filter(|c| scoped_connection.as_ref().map_or(true, |id| *id == c.id))
                .map(|c| c.id.clone())
                .collect()
        };
        for connection_id in &connection_ids {
            if let Err(err) = self.validate_connection(connection_id).await {
                warn!("[Sync] Health check for {} failed: {}", connection_id, err);
            }
        }

        let targets: Vec<String> = {
            let state = self.state.lock().await;
            state
                .accounts
                .iter()
                .filter(|a| a.is_active)
                .filter(|a| scope.map_or(true, |id| id == a.id))
                .filter(|a| {
                    state
                        .connection(&a.connection_id)
                        .is_some_and(|c| c.status == ConnectionStatus::Connected)
                })
                .filter(|a| !state.queue.has_outstanding_sync(&a.id))
                .map(|a| a.id.clone())
                .collect()
        };

        let mut failures = Vec::new();
        for account_id in &targets {
            match self.ingest_account(account_id).await {
                Ok(summary) => {
                    result.accounts_synced += 1;
                    result.transactions_seen += summary.seen;
                    result.new_transactions += summary.new;
                    result.duplicates_skipped += summary.duplicates;
                }
                Err(err) => {
                    result.accounts_failed += 1;
                    failures.push(format!("{}: {}", account_id, err));
                    self.handle_account_failure(account_id, err, created).await;
                }
            }
        }
        if !failures.is_empty() {
            result.status = SyncCycleStatus::Partial;
            warn!(
                "[Sync] {} of {} account(s) failed: {}",
                failures.len(),
                targets.len(),
                failures.join("; ")
            );
        }

        result.conflicts_detected += self.detect_duplicate_conflicts().await;
        result.auto_matched += self.auto_match_pass().await?;

        if result.new_transactions > 0 {
            let now = self.now();
            let mut state = self.state.lock().await;
            let count = result.new_transactions;
            state.alerts.add_alert(
                AlertType::NewTransactions,
                format!("{} new transaction{}", count, if count == 1 { "" } else { "s" }),
                format!(
                    "Imported {} transaction(s); {} matched automatically.",
                    count, result.auto_matched
                ),
                now,
            );
        }
        Ok(())
    }

    /// Fetches and ingests one account. Existing transactions are never modified.
    pub(super) async fn ingest_account(&self, account_id: &str) -> Result<IngestSummary> {
        let (account, connection) = {
            let state = self.state.lock().await;
            let account = state
                .account(account_id)
                .cloned()
                .ok_or_else(|| Error::invalid_argument(format!("unknown account {}", account_id)))?;
            let connection = state
                .connection(&account.connection_id)
                .cloned()
                .ok_or_else(|| {
                    Error::invalid_state(format!("account {} has no connection", account_id))
                })?;
            (account, connection)
        };

        let token = self
            .authenticator
            .get_token(&connection.id)
            .await?
            .ok_or_else(|| {
                Error::auth_failed(format!("no access token for {}", connection.institution_name))
            })?;
        if token.is_expired(self.now()) {
            return Err(Error::auth_failed(format!(
                "access token for {} expired",
                connection.institution_name
            )));
        }

        let provider = self.provider_for(connection.provider)?;
        let activity = provider
            .fetch_transactions(&token, &account.provider_account_id, account.last_sync_at)
            .await?;

        let now = self.now();
        let mut state = self.state.lock().await;
        let outcome = ingest_batch(&state.transactions, account_id, &activity.transactions, now);
        let summary = IngestSummary {
            seen: outcome.seen,
            new: outcome.new.len(),
            duplicates: outcome.duplicates,
        };
        state.transactions.extend(outcome.new);
        if let Some(acct) = state.accounts.iter_mut().find(|a| a.id == account_id) {
            acct.last_sync_at = Some(now);
            if let Some(balance) = activity.balance {
                acct.balance = balance;
            }
        }
        if let Some(conn) = state.connection_mut(&connection.id) {
            conn.last_sync_at = Some(now);
        }
        state
            .sync_stats
            .record_ingestion(summary.seen, summary.new, summary.duplicates);
        debug!(
            "[Sync] {}: {} seen, {} new, {} duplicate(s), {} invalid",
            account.name, summary.seen, summary.new, summary.duplicates, outcome.invalid
        );
        Ok(summary)
    }

    /// Counts the failure and decides what happens next for the account.
    pub(super) async fn handle_account_failure(
        &self,
        account_id: &str,
        err: Error,
        created: &mut HashSet<String>,
    ) {
        let now = self.now();
        let mut state = self.state.lock().await;
        state.sync_config.failed_attempts = state.sync_config.failed_attempts.saturating_add(1);

        match err.retry_class() {
            RetryClass::ReauthRequired => {
                let connection_id = state.account(account_id).map(|a| a.connection_id.clone());
                let mut alert = None;
                if let Some(conn) = connection_id
                    .as_deref()
                    .and_then(|id| state.connection_mut(id))
                {
                    if conn.status == ConnectionStatus::Connected {
                        if let Err(transition_err) =
                            conn.fail(ConnectionStatus::ReauthRequired, err.to_string(), now)
                        {
                            warn!("[Connect] {}", transition_err);
                        }
                    }
                    alert = Some((
                        EngineState::reauth_alert_title(conn),
                        conn.institution_name.clone(),
                    ));
                }
                if let Some((title, institution)) = alert {
                    state.alert_once(
                        AlertType::AuthRequired,
                        &title,
                        format!("{} needs you to sign in again.", institution),
                        now,
                    );
                }
            }
            RetryClass::Retryable => {
                let op = QueueOperation::Sync {
                    account_id: Some(account_id.to_string()),
                };
                match state.queue.enqueue(&op, now) {
                    Ok(item_id) => {
                        created.insert(item_id);
                    }
                    Err(enqueue_err) => {
                        warn!("[Queue] Could not queue retry for {}: {}", account_id, enqueue_err)
                    }
                }
            }
            RetryClass::Permanent => {
                warn!("[Sync] Account {} failed permanently: {}", account_id, err);
            }
        }
    }

    /// Raises duplicate conflicts on active accounts that are not already open
    /// or dismissed. Dismissals for other transactions are dropped.
    pub(super) async fn detect_duplicate_conflicts(&self) -> usize {
        let now = self.now();
        let mut state = self.state.lock().await;
        let active: HashSet<&str> = state
            .accounts
            .iter()
            .filter(|a| a.is_active)
            .map(|a| a.id.as_str())
            .collect();
        let live: Vec<BankTransaction> = state
            .transactions
            .iter()
            .filter(|t| active.contains(t.account_id.as_str()))
            .cloned()
            .collect();
        let found = detect_duplicates(&live, now);
        let live_ids: HashSet<&str> = live.iter().map(|t| t.id.as_str()).collect();
        let pruned = state.reconciliation.prune_acknowledged(&live_ids);
        if pruned > 0 {
            debug!("[Reconcile] Dropped {} stale dismissal(s)", pruned);
        }
        let raised = found
            .into_iter()
            .filter(|conflict| state.reconciliation.raise(conflict.clone()))
            .count();
        if raised > 0 {
            info!("[Reconcile] {} possible duplicate(s) flagged", raised);
            state.alert_once(
                AlertType::DuplicateDetected,
                DUPLICATE_ALERT_TITLE,
                format!("{} transaction(s) look like duplicates and need review.", raised),
                now,
            );
        }
        raised
    }

    /// Tries to match every unmatched debit. Returns how many were matched.
    pub(super) async fn auto_match_pass(&self) -> Result<usize> {
        let candidates = {
            let state = self.state.lock().await;
            let active: HashSet<&str> = state
                .accounts
                .iter()
                .filter(|a| a.is_active)
                .map(|a| a.id.as_str())
                .collect();
            state
                .transactions
                .iter()
                .filter(|t| t.is_unmatched() && t.is_debit())
                .filter(|t| active.contains(t.account_id.as_str()))
                .cloned()
                .collect::<Vec<_>>()
        };
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut matched = 0;
        for txn in &candidates {
            let expenses = self.ledger.find_candidates(&candidate_query(txn)).await?;

            let mut state = self.state.lock().await;
            if !state.transaction(&txn.id).is_some_and(|t| t.is_unmatched()) {
                continue;
            }
            let claimed = state.claimed_expense_ids(Some(&txn.id));
            let ranked = rank_candidates(txn, &expenses, &claimed);
            let threshold = state.reconciliation.auto_match_threshold;

            if let Some(best) = select_auto_match(&ranked, threshold).cloned() {
                if let Some(t) = state.transaction_mut(&txn.id) {
                    t.mark_matched(best.expense_id.clone(), Some(best.confidence));
                }
                state.reconciliation.clear_pending(&txn.id);
                matched += 1;
                debug!(
                    "[Reconcile] {} matched to expense {} ({})",
                    txn.id, best.expense_id, best.confidence
                );
            } else if ranked.is_empty() {
                state.reconciliation.clear_pending(&txn.id);
            } else {
                state
                    .reconciliation
                    .pending_matches
                    .insert(txn.id.clone(), ranked);
            }
        }

        self.state.lock().await.sync_stats.record_matches(matched);
        info!(
            "[Reconcile] Auto-matched {} of {} unmatched debit(s)",
            matched,
            candidates.len()
        );
        Ok(matched)
    }
}
