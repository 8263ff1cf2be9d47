//! Imported transactions and ingestion.

mod ingestion;
mod transactions_model;

pub use ingestion::*;
pub use transactions_model::*;
