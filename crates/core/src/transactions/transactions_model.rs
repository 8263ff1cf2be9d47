//! Imported bank transaction model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connections::RawTransaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Unmatched,
    Matched,
    Ignored,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Debit,
    Credit,
}

impl TransactionType {
    /// Negative amounts are money leaving the account.
    pub fn from_amount(amount: Decimal) -> Self {
        if amount.is_sign_negative() && !amount.is_zero() {
            TransactionType::Debit
        } else {
            TransactionType::Credit
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentChannel {
    Online,
    InStore,
    Other,
}

impl PaymentChannel {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_ascii_lowercase()) {
            Some(value) if value == "online" => PaymentChannel::Online,
            Some(value) if value == "in_store" || value == "in store" || value == "instore" => {
                PaymentChannel::InStore
            }
            _ => PaymentChannel::Other,
        }
    }
}

/// Imported transaction. Never deleted automatically.
///
/// `expense_id` is set exactly when the status is `matched` or `manual`, and
/// `confidence` only for automatic matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankTransaction {
    pub id: String,
    pub account_id: String,
    pub provider_transaction_id: String,
    pub amount: Decimal,
    pub description: String,
    pub original_description: String,
    pub merchant_name: Option<String>,
    pub categories: Vec<String>,
    pub date: NaiveDate,
    pub pending: bool,
    pub transaction_type: TransactionType,
    pub payment_channel: PaymentChannel,
    pub reconciliation_status: ReconciliationStatus,
    pub confidence: Option<Decimal>,
    pub expense_id: Option<String>,
    pub imported_at: DateTime<Utc>,
}

impl BankTransaction {
    pub fn from_raw(account_id: &str, raw: &RawTransaction, now: DateTime<Utc>) -> Self {
        let original_description = raw
            .original_description
            .clone()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| raw.description.clone());
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            provider_transaction_id: raw.provider_transaction_id.clone(),
            amount: raw.amount,
            description: raw.description.trim().to_string(),
            original_description,
            merchant_name: raw.merchant_name.clone(),
            categories: raw.categories.clone(),
            date: raw.date,
            pending: raw.pending,
            transaction_type: TransactionType::from_amount(raw.amount),
            payment_channel: PaymentChannel::parse(raw.payment_channel.as_deref()),
            reconciliation_status: ReconciliationStatus::Unmatched,
            confidence: None,
            expense_id: None,
            imported_at: now,
        }
    }

    pub fn is_unmatched(&self) -> bool {
        self.reconciliation_status == ReconciliationStatus::Unmatched
    }

    pub fn is_debit(&self) -> bool {
        self.transaction_type == TransactionType::Debit
    }

    /// Magnitude used when comparing against expense amounts.
    pub fn absolute_amount(&self) -> Decimal {
        self.amount.abs()
    }

    pub fn mark_matched(&mut self, expense_id: impl Into<String>, confidence: Option<Decimal>) {
        self.reconciliation_status = ReconciliationStatus::Matched;
        self.expense_id = Some(expense_id.into());
        self.confidence = confidence;
    }

    pub fn mark_manual(&mut self, expense_id: impl Into<String>) {
        self.reconciliation_status = ReconciliationStatus::Manual;
        self.expense_id = Some(expense_id.into());
        self.confidence = None;
    }

    pub fn mark_ignored(&mut self) {
        self.reconciliation_status = ReconciliationStatus::Ignored;
        self.expense_id = None;
        self.confidence = None;
    }

    /// Reverts any link back to `unmatched`.
    pub fn unlink(&mut self) {
        self.reconciliation_status = ReconciliationStatus::Unmatched;
        self.expense_id = None;
        self.confidence = None;
    }

    pub fn is_consistent(&self) -> bool {
        let linked = matches!(
            self.reconciliation_status,
            ReconciliationStatus::Matched | ReconciliationStatus::Manual
        );
        linked == self.expense_id.is_some()
            && (self.confidence.is_none()
                || self.reconciliation_status == ReconciliationStatus::Matched)
    }
}
