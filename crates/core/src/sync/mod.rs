//! Sync scheduling: configuration, trigger policy and the background loop.

mod sync_model;
mod sync_scheduler;

pub use sync_model::*;
pub use sync_scheduler::*;
