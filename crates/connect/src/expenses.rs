//! REST client for the expense service that owns user-entered expenses.

use async_trait::async_trait;
use bankfeed_core::reconciliation::{ExpenseLedger, ExpenseQuery, ExpenseRecord, NewExpense};
use log::debug;
use reqwest::StatusCode;

use crate::aggregator::{build_http_client, parse_response};
use crate::error::Result;

/// [`ExpenseLedger`] backed by `GET/POST {base}/expenses`.
#[derive(Debug, Clone)]
pub struct HttpExpenseLedger {
    client: reqwest::Client,
    base_url: String,
}

impl HttpExpenseLedger {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn query_params(query: &ExpenseQuery) -> [(&'static str, String); 4] {
        [
            ("dateFrom", query.date_from.to_string()),
            ("dateTo", query.date_to.to_string()),
            ("minAmount", query.min_amount.to_string()),
            ("maxAmount", query.max_amount.to_string()),
        ]
    }

    /// GET /expenses?dateFrom=&dateTo=&minAmount=&maxAmount=
    pub async fn list_expenses(&self, query: &ExpenseQuery) -> Result<Vec<ExpenseRecord>> {
        let url = format!("{}/expenses", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&Self::query_params(query))
            .send()
            .await?;
        parse_response(response).await
    }

    /// GET /expenses/{id}. A 404 is reported as `None`.
    pub async fn fetch_expense(&self, expense_id: &str) -> Result<Option<ExpenseRecord>> {
        let url = format!("{}/expenses/{}", self.base_url, expense_id);
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("[Connect] Expense {} not found", expense_id);
            return Ok(None);
        }
        parse_response(response).await.map(Some)
    }

    /// POST /expenses
    pub async fn create_expense(&self, expense: &NewExpense) -> Result<ExpenseRecord> {
        let url = format!("{}/expenses", self.base_url);
        let response = self.client.post(&url).json(expense).send().await?;
        parse_response(response).await
    }
}

#[async_trait]
impl ExpenseLedger for HttpExpenseLedger {
    async fn find_candidates(&self, query: &ExpenseQuery) -> bankfeed_core::Result<Vec<ExpenseRecord>> {
        self.list_expenses(query)
            .await
            .map_err(|err| err.into_ledger_error())
    }

    async fn get_expense(&self, expense_id: &str) -> bankfeed_core::Result<Option<ExpenseRecord>> {
        self.fetch_expense(expense_id)
            .await
            .map_err(|err| err.into_ledger_error())
    }

    async fn record_expense(&self, expense: NewExpense) -> bankfeed_core::Result<ExpenseRecord> {
        let record = self
            .create_expense(&expense)
            .await
            .map_err(|err| err.into_ledger_error())?;
        debug!(
            "[Connect] Expense service recorded {} for transaction {}",
            record.id, expense.source_transaction_id
        );
        Ok(record)
    }
}
