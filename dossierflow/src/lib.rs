//! # Dossierflow
//!
//! Incremental, checkpointed execution engine for the dossier step graph.
//!
//! Dossierflow runs a fixed graph of generation steps with:
//!
//! - **Dependency-ordered batches**: ready steps run concurrently up to a limit
//! - **Content-addressed caching**: identical inputs never call the service twice
//! - **Incremental rebuilds**: only steps downstream of a changed input re-run
//! - **Checkpoints**: failed or timed-out runs resume where they stopped
//! - **Token budgeting**: calls wait for per-model window capacity
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dossierflow::prelude::*;
//!
//! let config = EngineConfig::from_env()?;
//! let client = Arc::new(HttpGenerativeClient::from_env()?);
//! let scheduler = PipelineScheduler::dossier(config.clone(), EngineServices::new(&config, client))?;
//!
//! let input = PipelineInput::new("Orbital Freight", "Reusable cargo capsules ...");
//! let result = scheduler.execute(input, ExecuteOptions::new()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]

pub mod cache;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod gate;
pub mod graph;
pub mod observability;
pub mod pipeline;
pub mod rebuild;
pub mod testing;

#[cfg(feature = "http")]
pub mod llm;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{CacheBackend, ContentStore, FileBackend, InMemoryBackend};
    pub use crate::config::{EngineConfig, ModelConfig, TokenLimitConfig};
    pub use crate::core::{ArtifactStore, PipelineInput, PipelineState, StepStatus};
    pub use crate::errors::{DossierError, ErrorKind, GenerationError, StepError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{GenerationRequest, GenerativeClient, HandlerRegistry, RetryConfig};
    pub use crate::gate::TokenBudgetGate;
    pub use crate::graph::{dossier_graph, StepDefinition, StepGraph};
    pub use crate::pipeline::{
        CancellationToken, EngineServices, ExecuteOptions, PipelineResult, PipelineScheduler,
    };
    pub use crate::rebuild::{BuildState, RebuildAnalyzer, RebuildPlan};

    #[cfg(feature = "http")]
    pub use crate::llm::HttpGenerativeClient;
}
