//! Offline operation queue models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemType {
    Sync,
    Reconcile,
    Ignore,
    ManualMatch,
}

/// Queue item lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueItemStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, QueueItemStatus::Completed | QueueItemStatus::Failed)
    }
}

/// Deferred mutation stored until it can be applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionQueueItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: QueueItemType,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: QueueItemStatus,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Typed view over a queue item's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOperation {
    /// `None` re-runs a whole sync cycle; `Some` retries one account.
    Sync { account_id: Option<String> },
    Reconcile {
        transaction_id: String,
        expense_id: String,
    },
    Ignore { transaction_id: String },
    /// Record a new expense from the transaction and link it.
    ManualMatch { transaction_id: String },
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncPayload {
    #[serde(default)]
    account_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconcilePayload {
    transaction_id: String,
    expense_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionPayload {
    transaction_id: String,
}

impl QueueOperation {
    pub fn item_type(&self) -> QueueItemType {
        match self {
            QueueOperation::Sync { .. } => QueueItemType::Sync,
            QueueOperation::Reconcile { .. } => QueueItemType::Reconcile,
            QueueOperation::Ignore { .. } => QueueItemType::Ignore,
            QueueOperation::ManualMatch { .. } => QueueItemType::ManualMatch,
        }
    }

    pub fn to_payload(&self) -> Result<serde_json::Value> {
        let value = match self {
            QueueOperation::Sync { account_id } => serde_json::to_value(SyncPayload {
                account_id: account_id.clone(),
            })?,
            QueueOperation::Reconcile {
                transaction_id,
                expense_id,
            } => serde_json::to_value(ReconcilePayload {
                transaction_id: transaction_id.clone(),
                expense_id: expense_id.clone(),
            })?,
            QueueOperation::Ignore { transaction_id }
            | QueueOperation::ManualMatch { transaction_id } => {
                serde_json::to_value(TransactionPayload {
                    transaction_id: transaction_id.clone(),
                })?
            }
        };
        Ok(value)
    }

    /// Parses an item's payload. Malformed payloads are permanent failures.
    pub fn from_item(item: &TransactionQueueItem) -> Result<Self> {
        let payload = item.payload.clone();
        let parsed = match item.item_type {
            QueueItemType::Sync => {
                let p: SyncPayload = serde_json::from_value(payload)?;
                QueueOperation::Sync {
                    account_id: p.account_id,
                }
            }
            QueueItemType::Reconcile => {
                let p: ReconcilePayload = serde_json::from_value(payload)?;
                QueueOperation::Reconcile {
                    transaction_id: p.transaction_id,
                    expense_id: p.expense_id,
                }
            }
            QueueItemType::Ignore => {
                let p: TransactionPayload = serde_json::from_value(payload)?;
                QueueOperation::Ignore {
                    transaction_id: p.transaction_id,
                }
            }
            QueueItemType::ManualMatch => {
                let p: TransactionPayload = serde_json::from_value(payload)?;
                QueueOperation::ManualMatch {
                    transaction_id: p.transaction_id,
                }
            }
        };
        if let Some(id) = parsed.transaction_id() {
            if id.trim().is_empty() {
                return Err(Error::validation(format!(
                    "queue item {} has an empty transaction id",
                    item.id
                )));
            }
        }
        Ok(parsed)
    }

    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            QueueOperation::Sync { .. } => None,
            QueueOperation::Reconcile { transaction_id, .. }
            | QueueOperation::Ignore { transaction_id }
            | QueueOperation::ManualMatch { transaction_id } => Some(transaction_id),
        }
    }
}

/// Summary of one queue drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDrainSummary {
    pub processed: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub purged: usize,
    /// Accounts fetched by queued account syncs.
    pub accounts_synced: usize,
    pub new_transactions: usize,
}
