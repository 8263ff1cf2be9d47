//! Matching of bank transactions to user-entered expenses.

mod conflicts;
mod expenses;
mod matcher;
mod reconciliation_model;

pub use conflicts::*;
pub use expenses::*;
pub use matcher::*;
pub use reconciliation_model::*;
