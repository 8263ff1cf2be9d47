//! Institution connections, accounts and the provider contract.

mod connections_model;
mod providers;

pub use connections_model::*;
pub use providers::*;
