//! Sync configuration, statistics and cycle outcomes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::queue::{QueueDrainSummary, RetryPolicy};

/// Periodic syncs are suppressed this soon after a successful one.
pub const MIN_SYNC_INTERVAL_MINUTES: i64 = 5;

/// Time in background after which returning to the foreground triggers a sync.
pub const FOREGROUND_SYNC_THRESHOLD_MINUTES: i64 = 10;

pub const MAX_RETRIES_LIMIT: u32 = 10;

/// User-tunable sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub auto_sync: bool,
    pub sync_interval_minutes: u32,
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub retry_delay_seconds: u64,
    /// Account fetch failures since the last fully successful cycle.
    #[serde(default)]
    pub failed_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            sync_interval_minutes: 60,
            max_retries: 3,
            backoff_multiplier: 2.0,
            retry_delay_seconds: 30,
            failed_attempts: 0,
        }
    }
}

impl SyncConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay_seconds: self.retry_delay_seconds,
            backoff_multiplier: self.backoff_multiplier,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::minutes(i64::from(self.sync_interval_minutes))
    }

    pub fn validate(&self) -> Result<()> {
        if i64::from(self.sync_interval_minutes) < MIN_SYNC_INTERVAL_MINUTES {
            return Err(Error::invalid_argument(format!(
                "sync interval must be at least {} minutes",
                MIN_SYNC_INTERVAL_MINUTES
            )));
        }
        if self.max_retries == 0 || self.max_retries > MAX_RETRIES_LIMIT {
            return Err(Error::invalid_argument(format!(
                "max retries must be between 1 and {}",
                MAX_RETRIES_LIMIT
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_argument(
                "backoff multiplier must be at least 1.0",
            ));
        }
        if self.retry_delay_seconds == 0 {
            return Err(Error::invalid_argument(
                "retry delay must be at least one second",
            ));
        }
        Ok(())
    }

    /// Applies a partial update, leaving `self` untouched when the result is invalid.
    pub fn apply(&mut self, update: SyncConfigUpdate) -> Result<()> {
        let mut next = self.clone();
        if let Some(auto_sync) = update.auto_sync {
            next.auto_sync = auto_sync;
        }
        if let Some(minutes) = update.sync_interval_minutes {
            next.sync_interval_minutes = minutes;
        }
        if let Some(max_retries) = update.max_retries {
            next.max_retries = max_retries;
        }
        if let Some(multiplier) = update.backoff_multiplier {
            next.backoff_multiplier = multiplier;
        }
        if let Some(delay) = update.retry_delay_seconds {
            next.retry_delay_seconds = delay;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// Partial configuration update. `failed_attempts` is engine-owned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfigUpdate {
    pub auto_sync: Option<bool>,
    pub sync_interval_minutes: Option<u32>,
    pub max_retries: Option<u32>,
    pub backoff_multiplier: Option<f64>,
    pub retry_delay_seconds: Option<u64>,
}

/// Cumulative sync counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub transactions_seen: u64,
    pub new_transactions: u64,
    pub matched_transactions: u64,
    pub duplicates_skipped: u64,
    pub last_sync_duration_ms: i64,
    pub average_sync_duration_ms: f64,
    pub success_rate: f64,
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
}

impl SyncStats {
    pub fn record_ingestion(&mut self, seen: usize, new: usize, duplicates: usize) {
        self.transactions_seen += seen as u64;
        self.new_transactions += new as u64;
        self.duplicates_skipped += duplicates as u64;
    }

    pub fn record_matches(&mut self, matched: usize) {
        self.matched_transactions += matched as u64;
    }

    pub fn record_cycle(&mut self, status: SyncCycleStatus, duration_ms: i64, finished_at: DateTime<Utc>) {
        let previous_total = self.total_syncs as f64;
        self.total_syncs += 1;
        if status.is_successful() {
            self.successful_syncs += 1;
            self.last_successful_sync_at = Some(finished_at);
        }
        self.last_sync_duration_ms = duration_ms;
        self.average_sync_duration_ms = (self.average_sync_duration_ms * previous_total
            + duration_ms as f64)
            / self.total_syncs as f64;
        self.success_rate = self.successful_syncs as f64 / self.total_syncs as f64;
        self.last_sync_at = Some(finished_at);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Periodic,
    Foreground,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadySyncing,
    TooSoon,
    AutoSyncDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCycleStatus {
    /// Every targeted account synced.
    Ok,
    /// Some accounts failed and were queued for retry.
    Partial,
    NotAuthenticated,
    /// The cycle itself failed and was queued.
    Failed,
}

impl SyncCycleStatus {
    pub fn is_successful(self) -> bool {
        matches!(self, SyncCycleStatus::Ok | SyncCycleStatus::Partial)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCycleResult {
    pub trigger: SyncTrigger,
    pub status: SyncCycleStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub accounts_synced: usize,
    pub accounts_failed: usize,
    pub transactions_seen: usize,
    pub new_transactions: usize,
    pub duplicates_skipped: usize,
    pub auto_matched: usize,
    pub conflicts_detected: usize,
    pub queue: QueueDrainSummary,
    pub error: Option<String>,
}

impl SyncCycleResult {
    pub fn new(trigger: SyncTrigger, started_at: DateTime<Utc>) -> Self {
        Self {
            trigger,
            status: SyncCycleStatus::Ok,
            started_at,
            duration_ms: 0,
            accounts_synced: 0,
            accounts_failed: 0,
            transactions_seen: 0,
            new_transactions: 0,
            duplicates_skipped: 0,
            auto_matched: 0,
            conflicts_detected: 0,
            queue: QueueDrainSummary::default(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome", content = "detail")]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Completed(SyncCycleResult),
}

impl SyncOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, SyncOutcome::Skipped(_))
    }

    pub fn result(&self) -> Option<&SyncCycleResult> {
        match self {
            SyncOutcome::Completed(result) => Some(result),
            SyncOutcome::Skipped(_) => None,
        }
    }
}

/// Decides whether a trigger may start a cycle. `None` means go ahead.
pub fn should_run(
    trigger: SyncTrigger,
    config: &SyncConfig,
    last_successful_sync_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<SkipReason> {
    match trigger {
        SyncTrigger::Manual => None,
        SyncTrigger::Foreground if !config.auto_sync => Some(SkipReason::AutoSyncDisabled),
        SyncTrigger::Foreground => None,
        SyncTrigger::Periodic if !config.auto_sync => Some(SkipReason::AutoSyncDisabled),
        SyncTrigger::Periodic => match last_successful_sync_at {
            Some(last) if now - last < Duration::minutes(MIN_SYNC_INTERVAL_MINUTES) => {
                Some(SkipReason::TooSoon)
            }
            _ => None,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppLifecycle {
    Active,
    Background,
}
