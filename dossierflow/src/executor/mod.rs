//! Single-step execution.
//!
//! This module provides:
//! - The [`GenerativeClient`] seam to the external service
//! - Step handlers that prepare prompts or compute outputs locally
//! - Retry with backoff for transient failures
//! - [`StepExecutor`], which ties cache, gate, timeout and retry together

mod client;
mod handler;
mod retry;
mod step_executor;

pub use client::{GenerationRequest, GenerativeClient};
pub use handler::{
    AssembleHandler, HandlerRegistry, PitchIntakeHandler, PromptHandler,
    PromptParts, StepHandler, StepInputs, StepOutputs, StepWork,
};
pub use retry::{should_retry, with_retry, RetryConfig, RetryDecision, RetryOutcome, RetryState};
pub use step_executor::{StepExecutor, StepRunResult};

#[cfg(test)]
pub(crate) use client::MockGenerativeClient;
