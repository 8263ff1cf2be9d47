//! Confidence scoring between bank transactions and expenses.

use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use super::{ExpenseQuery, ExpenseRecord, MatchSuggestion};
use crate::transactions::BankTransaction;

pub const MATCH_DATE_WINDOW_DAYS: i64 = 3;
pub const MAX_SUGGESTIONS: usize = 5;

const AMOUNT_WEIGHT: Decimal = dec!(0.5);
const DATE_WEIGHT: Decimal = dec!(0.3);
const TEXT_WEIGHT: Decimal = dec!(0.2);
const MIN_AMOUNT_TOLERANCE: Decimal = dec!(1.00);
const RELATIVE_AMOUNT_TOLERANCE: Decimal = dec!(0.10);
const EXACT_AMOUNT_EPSILON: Decimal = dec!(0.01);
const DATE_DECAY_DAYS: Decimal = dec!(4);
const CONFIDENCE_SCALE: u32 = 4;

/// Largest amount difference still considered a candidate.
pub fn amount_tolerance(amount: Decimal) -> Decimal {
    (amount.abs() * RELATIVE_AMOUNT_TOLERANCE).max(MIN_AMOUNT_TOLERANCE)
}

pub fn candidate_query(txn: &BankTransaction) -> ExpenseQuery {
    let amount = txn.absolute_amount();
    let tolerance = amount_tolerance(amount);
    ExpenseQuery {
        date_from: txn.date - Duration::days(MATCH_DATE_WINDOW_DAYS),
        date_to: txn.date + Duration::days(MATCH_DATE_WINDOW_DAYS),
        min_amount: (amount - tolerance).max(Decimal::ZERO),
        max_amount: amount + tolerance,
    }
}

/// Lowercase alphanumeric words, skipping store numbers and single letters.
fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 2)
        .filter(|word| !word.chars().all(|c| c.is_ascii_digit()))
        .map(|word| word.to_lowercase())
        .collect()
}

/// Jaccard overlap of token sets.
pub fn text_similarity(left: &str, right: &str) -> Decimal {
    let left = tokenize(left);
    let right = tokenize(right);
    let union = left.union(&right).count();
    if union == 0 {
        return Decimal::ZERO;
    }
    let shared = left.intersection(&right).count();
    Decimal::from(shared as u64) / Decimal::from(union as u64)
}

fn amount_score(difference: Decimal, tolerance: Decimal) -> Decimal {
    if difference < EXACT_AMOUNT_EPSILON {
        return Decimal::ONE;
    }
    (Decimal::ONE - difference / tolerance).max(Decimal::ZERO)
}

fn date_score(days_apart: i64) -> Decimal {
    (Decimal::ONE - Decimal::from(days_apart) / DATE_DECAY_DAYS).max(Decimal::ZERO)
}

fn transaction_text(txn: &BankTransaction) -> String {
    match &txn.merchant_name {
        Some(merchant) => format!("{} {}", txn.description, merchant),
        None => txn.description.clone(),
    }
}

fn expense_text(expense: &ExpenseRecord) -> String {
    match &expense.merchant {
        Some(merchant) => format!("{} {}", expense.description, merchant),
        None => expense.description.clone(),
    }
}

/// Scores one candidate, or `None` when it falls outside the match window.
pub fn score(txn: &BankTransaction, expense: &ExpenseRecord) -> Option<MatchSuggestion> {
    let amount = txn.absolute_amount();
    let tolerance = amount_tolerance(amount);
    let difference = (amount - expense.amount.abs()).abs();
    let days_apart = (txn.date - expense.date).num_days().abs();
    if difference > tolerance || days_apart > MATCH_DATE_WINDOW_DAYS {
        return None;
    }

    let confidence = AMOUNT_WEIGHT * amount_score(difference, tolerance)
        + DATE_WEIGHT * date_score(days_apart)
        + TEXT_WEIGHT * text_similarity(&transaction_text(txn), &expense_text(expense));

    Some(MatchSuggestion {
        expense_id: expense.id.clone(),
        confidence: confidence.round_dp(CONFIDENCE_SCALE),
        amount_difference: difference,
        days_apart,
        description: expense.description.clone(),
    })
}

/// Best candidates first; ties go to the closer date, then the lower id.
pub fn rank_candidates(
    txn: &BankTransaction,
    candidates: &[ExpenseRecord],
    claimed: &HashSet<String>,
) -> Vec<MatchSuggestion> {
    let mut ranked: Vec<MatchSuggestion> = candidates
        .iter()
        .filter(|expense| !claimed.contains(&expense.id))
        .filter_map(|expense| score(txn, expense))
        .collect();
    ranked.sort_by(|a, b| match b.confidence.cmp(&a.confidence) {
        Ordering::Equal => a
            .days_apart
            .cmp(&b.days_apart)
            .then_with(|| a.expense_id.cmp(&b.expense_id)),
        other => other,
    });
    ranked.truncate(MAX_SUGGESTIONS);
    ranked
}

pub fn select_auto_match(
    ranked: &[MatchSuggestion],
    threshold: Decimal,
) -> Option<&MatchSuggestion> {
    ranked.first().filter(|best| best.confidence >= threshold)
}
