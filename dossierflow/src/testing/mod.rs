//! Testing utilities for dossierflow.
//!
//! This module provides:
//! - A scripted generative client with per-prompt failure rules
//! - A cache backend that always fails
//! - A scheduler harness wired to in-memory collaborators

mod fixtures;
mod mocks;

pub use fixtures::{sample_input, test_config, TestEngine};
pub use mocks::{FailingBackend, Reply, ScriptedClient};
