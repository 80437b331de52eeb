//! Core runtime types shared by the scheduler, executor and stores.
//!
//! - Step status and per-step runtime records
//! - The per-run artifact store
//! - The pipeline input

mod artifact;
mod input;
mod state;
mod status;

pub use artifact::ArtifactStore;
pub use input::PipelineInput;
pub use state::{PipelineState, StepRuntimeStatus};
pub use status::StepStatus;
