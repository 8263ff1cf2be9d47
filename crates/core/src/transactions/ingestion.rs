//! Validation and deduplication of fetched transactions.

use chrono::{DateTime, Utc};
use log::warn;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::BankTransaction;
use crate::connections::RawTransaction;
use crate::errors::{Error, Result};

/// Amounts closer than this are considered the same transaction.
pub const DEDUP_AMOUNT_TOLERANCE: Decimal = dec!(0.01);

/// Counts for one account's ingestion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestionOutcome {
    pub seen: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub new: Vec<BankTransaction>,
}

/// Rejects rows that cannot be ingested at all.
pub fn validate_raw(raw: &RawTransaction) -> Result<()> {
    if raw.provider_transaction_id.trim().is_empty() {
        return Err(Error::validation("transaction is missing a provider id"));
    }
    if raw.description.trim().is_empty() {
        return Err(Error::validation(format!(
            "transaction {} has an empty description",
            raw.provider_transaction_id
        )));
    }
    Ok(())
}

fn original_description(raw: &RawTransaction) -> &str {
    raw.original_description
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(&raw.description)
}

/// Same account, same original description, amounts within a cent.
pub fn is_known(known: &[BankTransaction], account_id: &str, raw: &RawTransaction) -> bool {
    let description = original_description(raw);
    known.iter().any(|txn| {
        txn.account_id == account_id
            && txn.original_description == description
            && (txn.amount - raw.amount).abs() < DEDUP_AMOUNT_TOLERANCE
    })
}

/// Turns a fetched batch into new transactions. Existing rows are never touched;
/// the dedup check also runs against rows accepted earlier in the same batch.
pub fn ingest_batch(
    existing: &[BankTransaction],
    account_id: &str,
    raws: &[RawTransaction],
    now: DateTime<Utc>,
) -> IngestionOutcome {
    let mut outcome = IngestionOutcome {
        seen: raws.len(),
        ..Default::default()
    };

    for raw in raws {
        if let Err(err) = validate_raw(raw) {
            warn!("[Sync] Dropping row for account {}: {}", account_id, err);
            outcome.invalid += 1;
            continue;
        }
        if is_known(existing, account_id, raw) || is_known(&outcome.new, account_id, raw) {
            outcome.duplicates += 1;
            continue;
        }
        outcome
            .new
            .push(BankTransaction::from_raw(account_id, raw, now));
    }

    outcome
}
