//! Progress events and the externally observable artifact log.
//!
//! Sinks are injected into the scheduler and executor; there is no global
//! sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event names emitted by the engine.
pub mod names {
    /// A run started executing.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// A run finished successfully.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A run failed.
    pub const PIPELINE_FAILED: &str = "pipeline.failed";
    /// A checkpoint was written.
    pub const CHECKPOINT_SAVED: &str = "pipeline.checkpoint";
    /// A step was launched.
    pub const STEP_STARTED: &str = "step.started";
    /// A step finished successfully.
    pub const STEP_COMPLETED: &str = "step.completed";
    /// A step was skipped and its previous outputs reused.
    pub const STEP_SKIPPED: &str = "step.skipped";
    /// A tolerant step failed and a fallback payload was substituted.
    pub const STEP_FALLBACK: &str = "step.fallback";
    /// A step failed.
    pub const STEP_FAILED: &str = "step.failed";
    /// A step produced a new result. This is the artifact log.
    pub const STEP_RESULT: &str = "step.result";
}
