//! Expense ledger contract: the consumer that owns user-entered expenses.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use uuid::Uuid;

use crate::errors::{Error, Result};

/// A user-entered expense. Amounts are positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseRecord {
    pub id: String,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub description: String,
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

/// Candidate window for matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseQuery {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
}

impl ExpenseQuery {
    pub fn contains(&self, expense: &ExpenseRecord) -> bool {
        expense.date >= self.date_from
            && expense.date <= self.date_to
            && expense.amount >= self.min_amount
            && expense.amount <= self.max_amount
    }
}

/// Expense to create from a bank transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewExpense {
    pub amount: Decimal,
    pub date: NaiveDate,
    pub description: String,
    pub merchant: Option<String>,
    pub category: Option<String>,
    pub source_transaction_id: String,
}

#[async_trait]
pub trait ExpenseLedger: Send + Sync {
    async fn find_candidates(&self, query: &ExpenseQuery) -> Result<Vec<ExpenseRecord>>;
    async fn get_expense(&self, expense_id: &str) -> Result<Option<ExpenseRecord>>;
    async fn record_expense(&self, expense: NewExpense) -> Result<ExpenseRecord>;
}

/// Ledger kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryExpenseLedger {
    expenses: RwLock<Vec<ExpenseRecord>>,
}

impl InMemoryExpenseLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expenses(expenses: Vec<ExpenseRecord>) -> Self {
        Self {
            expenses: RwLock::new(expenses),
        }
    }

    pub fn insert(&self, expense: ExpenseRecord) -> Result<()> {
        let mut expenses = self
            .expenses
            .write()
            .map_err(|_| Error::ledger("expense ledger lock poisoned"))?;
        expenses.push(expense);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.expenses.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExpenseLedger for InMemoryExpenseLedger {
    async fn find_candidates(&self, query: &ExpenseQuery) -> Result<Vec<ExpenseRecord>> {
        let expenses = self
            .expenses
            .read()
            .map_err(|_| Error::ledger("expense ledger lock poisoned"))?;
        Ok(expenses
            .iter()
            .filter(|expense| query.contains(expense))
            .cloned()
            .collect())
    }

    async fn get_expense(&self, expense_id: &str) -> Result<Option<ExpenseRecord>> {
        let expenses = self
            .expenses
            .read()
            .map_err(|_| Error::ledger("expense ledger lock poisoned"))?;
        Ok(expenses.iter().find(|e| e.id == expense_id).cloned())
    }

    async fn record_expense(&self, expense: NewExpense) -> Result<ExpenseRecord> {
        let record = ExpenseRecord {
            id: Uuid::new_v4().to_string(),
            amount: expense.amount,
            date: expense.date,
            description: expense.description,
            merchant: expense.merchant,
            category: expense.category,
        };
        self.insert(record.clone())?;
        Ok(record)
    }
}
