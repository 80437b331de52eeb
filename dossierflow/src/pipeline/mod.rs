//! Pipeline execution.
//!
//! This module provides:
//! - [`PipelineScheduler`] with `execute` and `resume`
//! - Run options, results and checkpoints
//! - Cooperative cancellation and run deadlines

mod cancellation;
mod options;
mod scheduler;

pub use cancellation::{CancellationToken, DeadlineGuard};
pub use options::{
    validate_run_id, Checkpoint, ExecuteOptions, PipelineErrorInfo, PipelineResult,
};
pub use scheduler::{EngineServices, PipelineScheduler};
