//! Reconciliation state, suggestions and conflicts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Default confidence needed for an automatic match.
pub const DEFAULT_AUTO_MATCH_THRESHOLD: Decimal = dec!(0.8);

/// A ranked candidate expense for a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSuggestion {
    pub expense_id: String,
    pub confidence: Decimal,
    pub amount_difference: Decimal,
    pub days_apart: i64,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Duplicate,
    AmountMismatch,
    DateMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationConflict {
    pub id: String,
    pub kind: ConflictKind,
    pub transaction_id: String,
    pub related_transaction_id: Option<String>,
    pub expense_id: Option<String>,
    pub message: String,
    pub detected_at: DateTime<Utc>,
}

impl ReconciliationConflict {
    /// Stable identity of the condition, independent of the conflict id.
    pub fn fingerprint(&self) -> String {
        let related = self
            .related_transaction_id
            .as_deref()
            .or(self.expense_id.as_deref())
            .unwrap_or("-");
        format!("{:?}:{}:{}", self.kind, self.transaction_id, related)
    }
}

/// Flagged transaction id encoded in a fingerprint.
fn fingerprint_transaction(fingerprint: &str) -> Option<&str> {
    fingerprint.splitn(3, ':').nth(1)
}

/// How the user settles a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Accept as-is; the same condition is not raised again.
    Dismiss,
    /// Mark the flagged transaction ignored.
    IgnoreTransaction,
    /// Revert the flagged transaction to unmatched.
    Unlink,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationState {
    pub pending_matches: BTreeMap<String, Vec<MatchSuggestion>>,
    pub auto_match_threshold: Decimal,
    pub conflicts_to_resolve: Vec<ReconciliationConflict>,
    /// Fingerprints of dismissed conflicts.
    #[serde(default)]
    pub acknowledged: BTreeSet<String>,
}

impl Default for ReconciliationState {
    fn default() -> Self {
        Self {
            pending_matches: BTreeMap::new(),
            auto_match_threshold: DEFAULT_AUTO_MATCH_THRESHOLD,
            conflicts_to_resolve: Vec::new(),
            acknowledged: BTreeSet::new(),
        }
    }
}

impl ReconciliationState {
    /// Adds a conflict unless the same condition is open or was dismissed.
    pub fn raise(&mut self, conflict: ReconciliationConflict) -> bool {
        let fingerprint = conflict.fingerprint();
        if self.acknowledged.contains(&fingerprint)
            || self
                .conflicts_to_resolve
                .iter()
                .any(|open| open.fingerprint() == fingerprint)
        {
            return false;
        }
        self.conflicts_to_resolve.push(conflict);
        true
    }

    pub fn take_conflict(&mut self, conflict_id: &str) -> Option<ReconciliationConflict> {
        let index = self
            .conflicts_to_resolve
            .iter()
            .position(|c| c.id == conflict_id)?;
        Some(self.conflicts_to_resolve.remove(index))
    }

    pub fn clear_pending(&mut self, transaction_id: &str) {
        self.pending_matches.remove(transaction_id);
    }

    /// Forgets dismissals whose flagged transaction is not in `live`.
    pub fn prune_acknowledged(&mut self, live: &HashSet<&str>) -> usize {
        let before = self.acknowledged.len();
        self.acknowledged.retain(|fingerprint| {
            fingerprint_transaction(fingerprint).is_some_and(|id| live.contains(id))
        });
        before - self.acknowledged.len()
    }
}
