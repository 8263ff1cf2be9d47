//! Durable queue of operations deferred while offline or failing.

mod operation_queue;
mod queue_model;

pub use operation_queue::*;
pub use queue_model::*;
