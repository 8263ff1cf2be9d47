//! Bank account synchronisation and expense reconciliation engine.

pub mod alerts;
pub mod auth;
pub mod clock;
pub mod connections;
pub mod engine;
pub mod errors;
pub mod persistence;
pub mod queue;
pub mod reconciliation;
pub mod secrets;
pub mod sync;
pub mod transactions;

pub use engine::{BankingEngine, OperationOutcome};
pub use errors::{Error, Result, RetryClass};
