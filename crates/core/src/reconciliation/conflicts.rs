//! Conflict detection over imported transactions and manual links.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::matcher::MATCH_DATE_WINDOW_DAYS;
use super::{ConflictKind, ExpenseRecord, ReconciliationConflict};
use crate::transactions::{BankTransaction, ReconciliationStatus};

const MISMATCH_AMOUNT_TOLERANCE: Decimal = dec!(0.01);

/// Flags transactions sharing account, amount and date with an earlier one.
///
/// Input order is import order; the first row of each group is treated as the
/// original and every later row is reported against it. Ignored rows are skipped.
pub fn detect_duplicates(
    transactions: &[BankTransaction],
    now: DateTime<Utc>,
) -> Vec<ReconciliationConflict> {
    let mut groups: BTreeMap<(&str, Decimal, NaiveDate), Vec<&BankTransaction>> = BTreeMap::new();
    for txn in transactions
        .iter()
        .filter(|t| t.reconciliation_status != ReconciliationStatus::Ignored)
    {
        groups
            .entry((txn.account_id.as_str(), txn.amount.normalize(), txn.date))
            .or_default()
            .push(txn);
    }

    let mut conflicts = Vec::new();
    for group in groups.values().filter(|g| g.len() > 1) {
        let original = group[0];
        for dup in &group[1..] {
            conflicts.push(ReconciliationConflict {
                id: Uuid::new_v4().to_string(),
                kind: ConflictKind::Duplicate,
                transaction_id: dup.id.clone(),
                related_transaction_id: Some(original.id.clone()),
                expense_id: None,
                message: format!(
                    "\"{}\" looks like a duplicate of \"{}\" ({} on {})",
                    dup.description, original.description, dup.amount, dup.date
                ),
                detected_at: now,
            });
        }
    }
    conflicts
}

/// Checks a user-chosen link for amount or date disagreement.
pub fn detect_link_mismatches(
    txn: &BankTransaction,
    expense: &ExpenseRecord,
    now: DateTime<Utc>,
) -> Vec<ReconciliationConflict> {
    let mut conflicts = Vec::new();

    let difference = (txn.absolute_amount() - expense.amount.abs()).abs();
    if difference > MISMATCH_AMOUNT_TOLERANCE {
        conflicts.push(ReconciliationConflict {
            id: Uuid::new_v4().to_string(),
            kind: ConflictKind::AmountMismatch,
            transaction_id: txn.id.clone(),
            related_transaction_id: None,
            expense_id: Some(expense.id.clone()),
            message: format!(
                "Transaction amount {} differs from expense amount {} by {}",
                txn.absolute_amount(),
                expense.amount,
                difference
            ),
            detected_at: now,
        });
    }

    let days_apart = (txn.date - expense.date).num_days().abs();
    if days_apart > MATCH_DATE_WINDOW_DAYS {
        conflicts.push(ReconciliationConflict {
            id: Uuid::new_v4().to_string(),
            kind: ConflictKind::DateMismatch,
            transaction_id: txn.id.clone(),
            related_transaction_id: None,
            expense_id: Some(expense.id.clone()),
            message: format!(
                "Transaction date {} is {} days from expense date {}",
                txn.date, days_apart, expense.date
            ),
            detected_at: now,
        });
    }

    conflicts
}
