//! Offline queue draining and per-type handlers.

use log::{debug, info, warn};
use std::collections::HashSet;

use super::sync_cycle::IngestSummary;
use super::{BankingEngine, OperationOutcome};
use crate::alerts::AlertType;
use crate::connections::ConnectionStatus;
use crate::errors::{Error, Result};
use crate::queue::{FailureDisposition, QueueDrainSummary, QueueItemType, QueueOperation};
use crate::sync::{SyncCycleResult, SyncCycleStatus, SyncTrigger};

impl BankingEngine {
    /// Processes every due item and purges old finished ones, then persists.
    ///
    /// Takes the sync guard. While a cycle holds it, queued syncs are left for
    /// that cycle's own drain and only user mutations are applied.
    pub async fn drain_queue(&self) -> QueueDrainSummary {
        let sync_guard = self.try_begin_sync();
        if sync_guard.is_none() {
            debug!("[Queue] Sync running, queued syncs left to its drain");
        }
        let summary = self
            .drain_queue_excluding(&HashSet::new(), sync_guard.is_some())
            .await;
        self.persist_or_warn().await;
        summary
    }

    /// Drains due items, skipping `exclude` (items created by the running cycle).
    /// Sync items only run when the caller holds the sync guard.
    pub(super) async fn drain_queue_excluding(
        &self,
        exclude: &HashSet<String>,
        include_syncs: bool,
    ) -> QueueDrainSummary {
        let mut summary = QueueDrainSummary::default();
        let due: Vec<String> = {
            let state = self.state.lock().await;
            state
                .queue
                .due_item_ids(self.now(), exclude)
                .into_iter()
                .filter(|id| {
                    include_syncs
                        || state
                            .queue
                            .get(id)
                            .is_some_and(|item| item.item_type != QueueItemType::Sync)
                })
                .collect()
        };

        for item_id in due {
            let item = {
                let mut state = self.state.lock().await;
                state.queue.begin(&item_id)
            };
            let Some(item) = item else { continue };
            summary.processed += 1;

            let outcome = match QueueOperation::from_item(&item) {
                Ok(operation) => self.apply_queued(operation).await,
                Err(err) => Err(err),
            };

            let now = self.now();
            let mut state = self.state.lock().await;
            match outcome {
                Ok(ingested) => {
                    if let Some(ingested) = ingested {
                        summary.accounts_synced += 1;
                        summary.new_transactions += ingested.new;
                    }
                    state.queue.complete(&item_id, now);
                    summary.completed += 1;
                    debug!("[Queue] {:?} item {} completed", item.item_type, item_id);
                }
                Err(err) => {
                    let policy = state.sync_config.retry_policy();
                    match state.queue.record_failure(&item_id, &err, &policy, now) {
                        Some(FailureDisposition::Rescheduled { .. }) => summary.rescheduled += 1,
                        Some(FailureDisposition::Failed) => {
                            summary.failed += 1;
                            state.alerts.add_alert(
                                AlertType::SyncFailed,
                                "Sync failed",
                                format!(
                                    "A queued {:?} operation gave up after {} attempt(s): {}",
                                    item.item_type,
                                    item.retry_count + 1,
                                    err
                                ),
                                now,
                            );
                        }
                        None => {}
                    }
                }
            }
        }

        let now = self.now();
        summary.purged = self.state.lock().await.queue.cleanup(now);
        if summary.processed > 0 || summary.purged > 0 {
            info!(
                "[Queue] Drain: {} processed, {} completed, {} rescheduled, {} failed, {} purged",
                summary.processed,
                summary.completed,
                summary.rescheduled,
                summary.failed,
                summary.purged
            );
        }
        summary
    }

    /// Applies one queued operation. Returns the ingestion counts when a
    /// queued account sync fetched the account.
    async fn apply_queued(&self, operation: QueueOperation) -> Result<Option<IngestSummary>> {
        match operation {
            QueueOperation::Sync {
                account_id: Some(account_id),
            } => self.retry_account_sync(&account_id).await,
            QueueOperation::Sync { account_id: None } => {
                let mut result = SyncCycleResult::new(SyncTrigger::Manual, self.now());
                let mut created = HashSet::new();
                self.run_sync_steps(None, &mut result, &mut created).await?;
                match result.status {
                    SyncCycleStatus::NotAuthenticated => {
                        Err(Error::auth_failed("not signed in"))
                    }
                    _ => Ok(None),
                }
            }
            QueueOperation::Reconcile {
                transaction_id,
                expense_id,
            } => {
                self.apply_reconcile(&transaction_id, Some(&expense_id))
                    .await?;
                Ok(None)
            }
            QueueOperation::ManualMatch { transaction_id } => {
                self.apply_reconcile(&transaction_id, None).await?;
                Ok(None)
            }
            QueueOperation::Ignore { transaction_id } => {
                self.apply_ignore(&transaction_id).await?;
                Ok(None)
            }
        }
    }

    /// Queued retry for one account. Accounts that were disconnected or whose
    /// connection is no longer usable are skipped.
    async fn retry_account_sync(&self, account_id: &str) -> Result<Option<IngestSummary>> {
        {
            let state = self.state.lock().await;
            let account = state.account(account_id).ok_or_else(|| {
                Error::invalid_argument(format!("unknown account {}", account_id))
            })?;
            let usable = account.is_active
                && state
                    .connection(&account.connection_id)
                    .is_some_and(|c| c.status == ConnectionStatus::Connected);
            if !usable {
                debug!("[Queue] Skipping sync retry for inactive account {}", account_id);
                return Ok(None);
            }
        }

        let summary = self.ingest_account(account_id).await?;
        self.detect_duplicate_conflicts().await;
        if summary.new > 0 {
            self.auto_match_pass().await?;
        }
        Ok(Some(summary))
    }

    /// Stores a user mutation for the next drain.
    pub(super) async fn defer(&self, operation: QueueOperation) -> Result<OperationOutcome> {
        let item_id = {
            let now = self.now();
            let mut state = self.state.lock().await;
            state.queue.enqueue(&operation, now)?
        };
        debug!("[Queue] Deferred {:?} as {}", operation.item_type(), item_id);
        self.persist_or_warn().await;
        Ok(OperationOutcome::Queued { item_id })
    }

    /// Logs and defers an operation whose immediate attempt failed transiently.
    pub(super) async fn defer_after_failure(
        &self,
        operation: QueueOperation,
        err: &Error,
    ) -> Result<OperationOutcome> {
        warn!(
            "[Queue] {:?} could not be applied now, queued: {}",
            operation.item_type(),
            err
        );
        self.defer(operation).await
    }
}
