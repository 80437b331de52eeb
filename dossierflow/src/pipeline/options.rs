//! Run options, run results and checkpoints.

use super::CancellationToken;
use crate::core::{ArtifactStore, PipelineInput, PipelineState};
use crate::errors::{DossierError, ErrorKind};
use crate::rebuild::RebuildPlan;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Options for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Bypass cache lookups and rebuild every step.
    pub skip_cache: bool,
    /// Maximum steps per batch; the engine default when unset.
    pub parallel_limit: Option<usize>,
    /// Wall-clock budget; the engine default when unset.
    pub timeout: Option<Duration>,
    /// External run identifier; generated when unset.
    pub run_id: Option<String>,
    /// Continue from the run's checkpoint when one exists.
    pub resume_from_checkpoint: bool,
    /// Caller-owned cancellation signal.
    pub cancellation: Option<Arc<CancellationToken>>,
}

impl ExecuteOptions {
    /// Creates options with engine defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bypasses the cache.
    #[must_use]
    pub fn with_skip_cache(mut self, skip: bool) -> Self {
        self.skip_cache = skip;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_parallel_limit(mut self, limit: usize) -> Self {
        self.parallel_limit = Some(limit);
        self
    }

    /// Sets the wall-clock budget.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the run identifier.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Resumes from a checkpoint when one exists for the run id.
    #[must_use]
    pub fn resume_from_checkpoint(mut self) -> Self {
        self.resume_from_checkpoint = true;
        self
    }

    /// Attaches a caller-owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Structured description of a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineErrorInfo {
    /// Error category.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// The failing step, if one is to blame.
    pub step: Option<String>,
    /// Whether `resume` can continue the run.
    pub resumable: bool,
}

impl PipelineErrorInfo {
    /// Describes an engine error.
    #[must_use]
    pub fn from_error(error: &DossierError, resumable: bool) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            step: error.step().map(str::to_string),
            resumable,
        }
    }
}

/// Outcome of `execute` or `resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Run identifier.
    pub run_id: String,
    /// Whether every step completed or was skipped.
    pub success: bool,
    /// The final artifact on success.
    pub data: Option<Value>,
    /// The failure, if any.
    pub error: Option<PipelineErrorInfo>,
    /// Per-step status for progress reporting.
    pub state: PipelineState,
    /// The plan the run followed.
    pub plan: RebuildPlan,
    /// Steps satisfied from the cache or skipped.
    pub cache_hits: usize,
    /// Run time in milliseconds.
    pub duration_ms: u64,
}

impl PipelineResult {
    /// Returns whether the run can be resumed.
    #[must_use]
    pub fn resumable(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.resumable)
    }
}

/// Durable snapshot of an in-progress run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run identifier; also the record key.
    pub run_id: String,
    /// Step statuses at save time.
    pub state: PipelineState,
    /// Artifacts produced so far.
    pub artifacts: ArtifactStore,
    /// Cache hits so far.
    pub cache_hits: usize,
    /// The plan of the run.
    pub plan: RebuildPlan,
    /// The input of the run.
    pub input: PipelineInput,
    /// The error that stopped the run, for error checkpoints.
    #[serde(default)]
    pub error: Option<String>,
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
    /// Whether the run bypasses the cache.
    #[serde(default)]
    pub skip_cache: bool,
    /// Batch size of the run.
    pub parallel_limit: usize,
}

const RUN_ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$";

fn run_id_matches(run_id: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(RUN_ID_PATTERN).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(run_id))
}

/// Checks that a run identifier is safe to use as a record key.
///
/// # Errors
///
/// Returns [`DossierError::InvalidRunId`] otherwise.
pub fn validate_run_id(run_id: &str) -> Result<(), DossierError> {
    if run_id_matches(run_id) {
        Ok(())
    } else {
        Err(DossierError::InvalidRunId(run_id.to_string()))
    }
}
