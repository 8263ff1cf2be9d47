//! User-driven reconciliation: manual links, ignores, suggestions, conflicts.

use log::{debug, info, warn};

use super::{BankingEngine, EngineState, OperationOutcome};
use crate::errors::{Error, Result, RetryClass};
use crate::queue::QueueOperation;
use crate::reconciliation::{
    candidate_query, detect_link_mismatches, rank_candidates, ConflictKind, ConflictResolution,
    MatchSuggestion, NewExpense, ReconciliationConflict,
};
use crate::transactions::ReconciliationStatus;

impl BankingEngine {
    /// Links a transaction to an existing expense, or records a new expense
    /// from it when `expense_id` is `None`.
    ///
    /// Transient ledger failures, and calls made while a sync is running, are
    /// queued and reported as [`OperationOutcome::Queued`].
    pub async fn reconcile_transaction(
        &self,
        transaction_id: &str,
        expense_id: Option<&str>,
    ) -> Result<OperationOutcome> {
        self.ensure_transaction(transaction_id).await?;
        let operation = match expense_id {
            Some(expense_id) => QueueOperation::Reconcile {
                transaction_id: transaction_id.to_string(),
                expense_id: expense_id.to_string(),
            },
            None => QueueOperation::ManualMatch {
                transaction_id: transaction_id.to_string(),
            },
        };
        if self.is_syncing() {
            return self.defer(operation).await;
        }

        match self.apply_reconcile(transaction_id, expense_id).await {
            Ok(()) => {
                self.persist_or_warn().await;
                Ok(OperationOutcome::Applied)
            }
            Err(err) if err.is_caller_error() || err.retry_class() == RetryClass::Permanent => {
                Err(err)
            }
            Err(err) => self.defer_after_failure(operation, &err).await,
        }
    }

    pub async fn mark_transaction_as_ignored(&self, transaction_id: &str) -> Result<OperationOutcome> {
        self.ensure_transaction(transaction_id).await?;
        if self.is_syncing() {
            return self
                .defer(QueueOperation::Ignore {
                    transaction_id: transaction_id.to_string(),
                })
                .await;
        }
        self.apply_ignore(transaction_id).await?;
        self.persist_or_warn().await;
        Ok(OperationOutcome::Applied)
    }

    async fn ensure_transaction(&self, transaction_id: &str) -> Result<()> {
        let state = self.state.lock().await;
        if state.transaction(transaction_id).is_none() {
            return Err(Error::invalid_argument(format!(
                "unknown transaction {}",
                transaction_id
            )));
        }
        Ok(())
    }

    /// Idempotent: re-applying a link that is already in place changes nothing.
    pub(super) async fn apply_reconcile(
        &self,
        transaction_id: &str,
        expense_id: Option<&str>,
    ) -> Result<()> {
        let txn = {
            let state = self.state.lock().await;
            state.transaction(transaction_id).cloned().ok_or_else(|| {
                Error::invalid_argument(format!("unknown transaction {}", transaction_id))
            })?
        };

        match expense_id {
            Some(expense_id) => {
                if txn.reconciliation_status == ReconciliationStatus::Matched
                    && txn.expense_id.as_deref() == Some(expense_id)
                {
                    return Ok(());
                }
                let expense = self.ledger.get_expense(expense_id).await?.ok_or_else(|| {
                    Error::invalid_argument(format!("unknown expense {}", expense_id))
                })?;

                let now = self.now();
                let mut state = self.state.lock().await;
                if state
                    .claimed_expense_ids(Some(transaction_id))
                    .contains(expense_id)
                {
                    return Err(Error::invalid_state(format!(
                        "expense {} is already linked to another transaction",
                        expense_id
                    )));
                }
                let Some(target) = state.transaction_mut(transaction_id) else {
                    return Err(Error::invalid_argument(format!(
                        "unknown transaction {}",
                        transaction_id
                    )));
                };
                target.mark_matched(expense_id, None);
                state.reconciliation.clear_pending(transaction_id);
                for conflict in detect_link_mismatches(&txn, &expense, now) {
                    if state.reconciliation.raise(conflict) {
                        warn!(
                            "[Reconcile] Manual link {} -> {} disagrees with the expense",
                            transaction_id, expense_id
                        );
                    }
                }
                info!("[Reconcile] {} linked to expense {}", transaction_id, expense_id);
            }
            None => {
                if txn.reconciliation_status == ReconciliationStatus::Manual {
                    return Ok(());
                }
                let record = self
                    .ledger
                    .record_expense(NewExpense {
                        amount: txn.absolute_amount(),
                        date: txn.date,
                        description: txn.description.clone(),
                        merchant: txn.merchant_name.clone(),
                        category: txn.categories.first().cloned(),
                        source_transaction_id: txn.id.clone(),
                    })
                    .await?;

                let mut state = self.state.lock().await;
                if let Some(target) = state.transaction_mut(transaction_id) {
                    target.mark_manual(record.id.clone());
                }
                state.reconciliation.clear_pending(transaction_id);
                info!(
                    "[Reconcile] Recorded expense {} from {}",
                    record.id, transaction_id
                );
            }
        }
        Ok(())
    }

    pub(super) async fn apply_ignore(&self, transaction_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let txn = state.transaction_mut(transaction_id).ok_or_else(|| {
            Error::invalid_argument(format!("unknown transaction {}", transaction_id))
        })?;
        txn.mark_ignored();
        state.reconciliation.clear_pending(transaction_id);

        // An open duplicate flag on the ignored row is settled as if the user
        // had picked IgnoreTransaction on it.
        let duplicate_ids: Vec<String> = state
            .reconciliation
            .conflicts_to_resolve
            .iter()
            .filter(|c| c.kind == ConflictKind::Duplicate && c.transaction_id == transaction_id)
            .map(|c| c.id.clone())
            .collect();
        for conflict_id in duplicate_ids {
            if let Some(conflict) = state.reconciliation.take_conflict(&conflict_id) {
                state.settle_conflict(&conflict, ConflictResolution::IgnoreTransaction);
                info!(
                    "[Reconcile] Conflict {} settled by ignoring {}",
                    conflict_id, transaction_id
                );
            }
        }
        debug!("[Reconcile] {} ignored", transaction_id);
        Ok(())
    }

    /// Ranked candidates for one transaction. Falls back to the last stored
    /// suggestions when the ledger is unreachable.
    pub async fn suggest_matches(&self, transaction_id: &str) -> Result<Vec<MatchSuggestion>> {
        let txn = {
            let state = self.state.lock().await;
            state.transaction(transaction_id).cloned().ok_or_else(|| {
                Error::invalid_argument(format!("unknown transaction {}", transaction_id))
            })?
        };

        match self.ledger.find_candidates(&candidate_query(&txn)).await {
            Ok(expenses) => {
                let mut state = self.state.lock().await;
                let claimed = state.claimed_expense_ids(Some(transaction_id));
                let ranked = rank_candidates(&txn, &expenses, &claimed);
                if ranked.is_empty() {
                    state.reconciliation.clear_pending(transaction_id);
                } else if txn.is_unmatched() {
                    state
                        .reconciliation
                        .pending_matches
                        .insert(transaction_id.to_string(), ranked.clone());
                }
                Ok(ranked)
            }
            Err(err) => {
                warn!(
                    "[Reconcile] Candidate lookup for {} failed, using stored suggestions: {}",
                    transaction_id, err
                );
                let state = self.state.lock().await;
                Ok(state
                    .reconciliation
                    .pending_matches
                    .get(transaction_id)
                    .cloned()
                    .unwrap_or_default())
            }
        }
    }

    /// Settles an open conflict. Ignoring its transaction directly settles an
    /// open duplicate flag the same way.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: ConflictResolution,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let conflict = state
                .reconciliation
                .take_conflict(conflict_id)
                .ok_or_else(|| Error::invalid_argument(format!("unknown conflict {}", conflict_id)))?;
            state.settle_conflict(&conflict, resolution);
            info!(
                "[Reconcile] Conflict {} ({:?}) resolved with {:?}",
                conflict_id, conflict.kind, resolution
            );
        }
        self.persist_or_warn().await;
        Ok(())
    }
}

impl EngineState {
    /// Applies a resolution to a conflict already taken off the open list.
    fn settle_conflict(
        &mut self,
        conflict: &ReconciliationConflict,
        resolution: ConflictResolution,
    ) {
        match resolution {
            ConflictResolution::Dismiss => {
                self.reconciliation.acknowledged.insert(conflict.fingerprint());
            }
            ConflictResolution::IgnoreTransaction => {
                if let Some(txn) = self.transaction_mut(&conflict.transaction_id) {
                    txn.mark_ignored();
                }
                self.reconciliation.clear_pending(&conflict.transaction_id);
            }
            ConflictResolution::Unlink => {
                if let Some(txn) = self.transaction_mut(&conflict.transaction_id) {
                    txn.unlink();
                }
                if conflict.kind == ConflictKind::Duplicate {
                    self.reconciliation.acknowledged.insert(conflict.fingerprint());
                }
            }
        }
    }
}
