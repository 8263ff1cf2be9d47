//! Institution and expense-ledger clients for the bankfeed engine.
//!
//! [`AggregatorClient`] talks to an aggregator REST API, [`HttpExpenseLedger`]
//! to the service that owns user expenses, and [`SandboxProvider`] serves a
//! fixed "Demo Bank" for local runs and tests.

mod aggregator;
mod error;
mod expenses;
mod sandbox;
mod types;

pub use aggregator::AggregatorClient;
pub use error::{ConnectError, Result};
pub use expenses::HttpExpenseLedger;
pub use sandbox::{SandboxProvider, DEMO_BANK_ID, DEMO_BANK_NAME};
pub use types::*;
