//! Self-healing scheduling primitives.

pub mod task;

pub use task::{job, Job, TaskRunner, TaskSpec};
