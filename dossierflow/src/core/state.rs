//! Per-run step state.

use super::StepStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Runtime record of one step in one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRuntimeStatus {
    /// Current status.
    pub status: StepStatus,
    /// When the step started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Run time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Content hash of the step outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Error text for failed steps, or the failure behind a fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the outputs came from the cache.
    #[serde(default)]
    pub cache_hit: bool,
    /// Attempts made by the executor.
    #[serde(default)]
    pub attempts: u32,
    /// Whether the outputs are a labeled fallback payload.
    #[serde(default)]
    pub fallback: bool,
}

/// Mapping from step identifier to its runtime status.
///
/// Owned by exactly one scheduler invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    /// The run this state belongs to.
    pub run_id: String,
    /// Per-step records.
    pub steps: BTreeMap<String, StepRuntimeStatus>,
}

impl PipelineState {
    /// Creates a state with every step pending.
    #[must_use]
    pub fn new<I, S>(run_id: impl Into<String>, step_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            run_id: run_id.into(),
            steps: step_ids
                .into_iter()
                .map(|id| (id.into(), StepRuntimeStatus::default()))
                .collect(),
        }
    }

    /// Returns the status of a step.
    #[must_use]
    pub fn status(&self, step: &str) -> StepStatus {
        self.steps
            .get(step)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// Returns the runtime record of a step.
    #[must_use]
    pub fn get(&self, step: &str) -> Option<&StepRuntimeStatus> {
        self.steps.get(step)
    }

    fn entry(&mut self, step: &str) -> &mut StepRuntimeStatus {
        self.steps.entry(step.to_string()).or_default()
    }

    /// Marks a step as running.
    pub fn mark_running(&mut self, step: &str) {
        let entry = self.entry(step);
        entry.status = StepStatus::Running;
        entry.started_at = Some(Utc::now());
        entry.ended_at = None;
        entry.error = None;
    }

    /// Marks a step as completed.
    pub fn mark_completed(
        &mut self,
        step: &str,
        duration_ms: u64,
        hash: Option<String>,
        cache_hit: bool,
        attempts: u32,
    ) {
        let entry = self.entry(step);
        entry.status = StepStatus::Completed;
        entry.ended_at = Some(Utc::now());
        entry.duration_ms = Some(duration_ms);
        entry.hash = hash;
        entry.cache_hit = cache_hit;
        entry.attempts = attempts;
    }

    /// Marks a step as completed with a fallback payload.
    pub fn mark_fallback(&mut self, step: &str, duration_ms: u64, hash: String, error: String, attempts: u32) {
        self.mark_completed(step, duration_ms, Some(hash), false, attempts);
        let entry = self.entry(step);
        entry.fallback = true;
        entry.error = Some(error);
    }

    /// Marks a step as failed.
    pub fn mark_failed(&mut self, step: &str, duration_ms: u64, error: impl Into<String>, attempts: u32) {
        let entry = self.entry(step);
        entry.status = StepStatus::Failed;
        entry.ended_at = Some(Utc::now());
        entry.duration_ms = Some(duration_ms);
        entry.error = Some(error.into());
        entry.attempts = attempts;
    }

    /// Marks a step as skipped with its reused output hash.
    pub fn mark_skipped(&mut self, step: &str, hash: Option<String>) {
        let now = Utc::now();
        let entry = self.entry(step);
        entry.status = StepStatus::Skipped;
        entry.started_at = Some(now);
        entry.ended_at = Some(now);
        entry.duration_ms = Some(0);
        entry.hash = hash;
        entry.cache_hit = true;
    }

    /// Returns every step in a done state (completed or skipped).
    #[must_use]
    pub fn done_steps(&self) -> HashSet<String> {
        self.steps
            .iter()
            .filter(|(_, s)| s.status.is_done())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Resets interrupted or failed steps so a resumed run retries them.
    pub fn reset_unfinished(&mut self) {
        for record in self.steps.values_mut() {
            if matches!(record.status, StepStatus::Running | StepStatus::Failed) {
                *record = StepRuntimeStatus::default();
            }
        }
    }

    /// Returns the first failed step, if any.
    #[must_use]
    pub fn failed_step(&self) -> Option<(&str, &StepRuntimeStatus)> {
        self.steps
            .iter()
            .find(|(_, s)| s.status == StepStatus::Failed)
            .map(|(id, s)| (id.as_str(), s))
    }

    /// Returns (done, total) for progress reporting.
    #[must_use]
    pub fn progress(&self) -> (usize, usize) {
        let done = self.steps.values().filter(|s| s.status.is_done()).count();
        (done, self.steps.len())
    }
}
