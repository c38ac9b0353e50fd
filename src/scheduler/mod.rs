//! Task Scheduler Module
//!
//! Long-running pool, group and volume operations executed as cancellable
//! background jobs with progress, checkpoints and retry.

pub mod executor;
pub mod task;

pub use executor::*;
pub use task::*;
