//! FIFO queue with retry bookkeeping and exponential backoff.

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use std::collections::HashSet;
use uuid::Uuid;

use super::{QueueItemStatus, QueueOperation, TransactionQueueItem};
use crate::errors::{Error, Result, RetryClass};

/// Finished items are kept this long before cleanup.
pub const QUEUE_RETENTION_DAYS: i64 = 7;

const MAX_RETRY_DELAY_MS: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

/// Retry knobs, taken from the sync configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Delay before the next attempt once an item has failed `retry_count` times.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let millis = (self.retry_delay_seconds as f64)
            * 1000.0
            * self.backoff_multiplier.powi(exponent);
        Duration::milliseconds(millis.min(MAX_RETRY_DELAY_MS) as i64)
    }
}

/// What happened to an item after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Rescheduled { next_attempt_at: DateTime<Utc> },
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationQueue {
    items: Vec<TransactionQueueItem>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores persisted items. Anything left mid-flight is retried.
    pub fn from_persisted(mut items: Vec<TransactionQueueItem>) -> Self {
        for item in &mut items {
            if item.status == QueueItemStatus::Processing {
                item.status = QueueItemStatus::Pending;
            }
        }
        Self { items }
    }

    /// Items as they should be written to storage.
    pub fn persisted(&self) -> Vec<TransactionQueueItem> {
        self.items
            .iter()
            .cloned()
            .map(|mut item| {
                if item.status == QueueItemStatus::Processing {
                    item.status = QueueItemStatus::Pending;
                }
                item
            })
            .collect()
    }

    pub fn items(&self) -> &[TransactionQueueItem] {
        &self.items
    }

    pub fn get(&self, item_id: &str) -> Option<&TransactionQueueItem> {
        self.items.iter().find(|item| item.id == item_id)
    }

    fn get_mut(&mut self, item_id: &str) -> Option<&mut TransactionQueueItem> {
        self.items.iter_mut().find(|item| item.id == item_id)
    }

    fn is_outstanding(item: &TransactionQueueItem) -> bool {
        !item.status.is_finished()
    }

    pub fn outstanding_count(&self) -> usize {
        self.items.iter().filter(|i| Self::is_outstanding(i)).count()
    }

    /// Adds an operation. An equivalent outstanding item is reused instead.
    pub fn enqueue(&mut self, operation: &QueueOperation, now: DateTime<Utc>) -> Result<String> {
        let item_type = operation.item_type();
        let payload = operation.to_payload()?;

        if let Some(existing) = self.items.iter().find(|item| {
            Self::is_outstanding(item) && item.item_type == item_type && item.payload == payload
        }) {
            debug!(
                "[Queue] {:?} already outstanding as {}, not enqueuing again",
                item_type, existing.id
            );
            return Ok(existing.id.clone());
        }

        let id = Uuid::new_v4().to_string();
        self.items.push(TransactionQueueItem {
            id: id.clone(),
            item_type,
            payload,
            enqueued_at: now,
            retry_count: 0,
            status: QueueItemStatus::Pending,
            last_error: None,
            next_attempt_at: now,
            finished_at: None,
        });
        debug!("[Queue] Enqueued {:?} item {}", item_type, id);
        Ok(id)
    }

    /// Pending items whose next attempt is due, oldest first.
    pub fn due_item_ids(&self, now: DateTime<Utc>, exclude: &HashSet<String>) -> Vec<String> {
        self.items
            .iter()
            .filter(|item| item.status == QueueItemStatus::Pending)
            .filter(|item| item.next_attempt_at <= now)
            .filter(|item| !exclude.contains(&item.id))
            .map(|item| item.id.clone())
            .collect()
    }

    /// Claims a pending item for processing.
    pub fn begin(&mut self, item_id: &str) -> Option<TransactionQueueItem> {
        let item = self.get_mut(item_id)?;
        if item.status != QueueItemStatus::Pending {
            return None;
        }
        item.status = QueueItemStatus::Processing;
        Some(item.clone())
    }

    pub fn complete(&mut self, item_id: &str, now: DateTime<Utc>) {
        if let Some(item) = self.get_mut(item_id) {
            item.status = QueueItemStatus::Completed;
            item.last_error = None;
            item.finished_at = Some(now);
        }
    }

    /// Records a failed attempt. Terminal once the retry budget is spent or
    /// the error can never succeed.
    pub fn record_failure(
        &mut self,
        item_id: &str,
        error: &Error,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Option<FailureDisposition> {
        let item = self.get_mut(item_id)?;
        item.retry_count = item.retry_count.saturating_add(1);
        item.last_error = Some(error.to_string());

        let permanent = error.retry_class() == RetryClass::Permanent;
        if permanent || item.retry_count >= policy.max_retries {
            item.status = QueueItemStatus::Failed;
            item.finished_at = Some(now);
            warn!(
                "[Queue] {:?} item {} failed after {} attempt(s): {}",
                item.item_type, item.id, item.retry_count, error
            );
            return Some(FailureDisposition::Failed);
        }

        let next_attempt_at = now + policy.delay_for(item.retry_count);
        item.status = QueueItemStatus::Pending;
        item.next_attempt_at = next_attempt_at;
        debug!(
            "[Queue] {:?} item {} retry {} scheduled for {}",
            item.item_type, item.id, item.retry_count, next_attempt_at
        );
        Some(FailureDisposition::Rescheduled { next_attempt_at })
    }

    /// Drops finished items older than the retention window.
    pub fn cleanup(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(QUEUE_RETENTION_DAYS);
        let before = self.items.len();
        self.items.retain(|item| match (item.status.is_finished(), item.finished_at) {
            (true, Some(finished_at)) => finished_at > cutoff,
            _ => true,
        });
        before - self.items.len()
    }

    /// True while a sync retry for this account is waiting or running.
    pub fn has_outstanding_sync(&self, account_id: &str) -> bool {
        self.items.iter().filter(|i| Self::is_outstanding(i)).any(|item| {
            matches!(
                QueueOperation::from_item(item),
                Ok(QueueOperation::Sync { account_id: Some(ref id) }) if id == account_id
            )
        })
    }
}
