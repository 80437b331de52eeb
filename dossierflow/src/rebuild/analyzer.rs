//! Incremental rebuild analysis.

use super::state::{BuildState, InputDigest};
use crate::graph::{InputComponent, StepGraph};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Partition of the graph into steps to execute and steps to reuse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildPlan {
    /// Steps that must execute.
    pub to_rebuild: BTreeSet<String>,
    /// Steps whose previous outputs are reused.
    pub to_skip: BTreeSet<String>,
    /// Human-readable explanation.
    pub reason: String,
    /// Sum of the per-step estimates of `to_rebuild`. Reporting only.
    pub estimated_duration_ms: u64,
    /// Input components detected as changed.
    #[serde(default)]
    pub changed: Vec<InputComponent>,
}

impl RebuildPlan {
    /// Returns true if every step is rebuilt.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.to_skip.is_empty()
    }

    /// Returns true if the step is to be executed.
    #[must_use]
    pub fn rebuilds(&self, step: &str) -> bool {
        self.to_rebuild.contains(step)
    }

    /// Moves a step from the skip set to the rebuild set.
    pub fn promote(&mut self, step: &str) {
        if self.to_skip.remove(step) {
            self.to_rebuild.insert(step.to_string());
        }
    }
}

/// Computes rebuild plans from input digests and the previous build state.
#[derive(Debug, Clone)]
pub struct RebuildAnalyzer {
    graph: Arc<StepGraph>,
}

impl RebuildAnalyzer {
    /// Creates an analyzer for a graph.
    #[must_use]
    pub fn new(graph: Arc<StepGraph>) -> Self {
        Self { graph }
    }

    fn full(&self, reason: impl Into<String>, changed: Vec<InputComponent>) -> RebuildPlan {
        let to_rebuild: BTreeSet<String> = self.graph.topological_order().iter().cloned().collect();
        RebuildPlan {
            estimated_duration_ms: self.graph.estimate_ms(&to_rebuild),
            to_rebuild,
            to_skip: BTreeSet::new(),
            reason: reason.into(),
            changed,
        }
    }

    /// Returns the input components that differ from the previous build.
    #[must_use]
    pub fn changed_components(current: &InputDigest, previous: &BuildState) -> Vec<InputComponent> {
        let mut changed = Vec::new();
        if current.pitch_hash != previous.pitch_hash {
            changed.push(InputComponent::Pitch);
        }
        // Evidence only counts when the caller supplies it; otherwise the
        // previously harvested evidence is reused.
        if let Some(hash) = &current.evidence_hash {
            if previous.evidence_hash.as_ref() != Some(hash) {
                changed.push(InputComponent::Evidence);
            }
        }
        changed
    }

    /// Computes the plan for one run.
    #[must_use]
    pub fn analyze(
        &self,
        current: &InputDigest,
        previous: Option<&BuildState>,
        skip_cache: bool,
    ) -> RebuildPlan {
        let plan = self.plan(current, previous, skip_cache);
        info!(
            rebuild = plan.to_rebuild.len(),
            skip = plan.to_skip.len(),
            estimated_ms = plan.estimated_duration_ms,
            reason = %plan.reason,
            "Rebuild plan computed"
        );
        plan
    }

    fn plan(&self, current: &InputDigest, previous: Option<&BuildState>, skip_cache: bool) -> RebuildPlan {
        if skip_cache {
            return self.full("Cache bypass requested; rebuilding every step", Vec::new());
        }
        let Some(previous) = previous else {
            return self.full("First build; no previous build state", vec![InputComponent::Pitch]);
        };
        if previous.prompt_version != current.prompt_version {
            return self.full(
                format!(
                    "Prompt version changed ({} -> {}); rebuilding every step",
                    if previous.prompt_version.is_empty() {
                        "unknown"
                    } else {
                        previous.prompt_version.as_str()
                    },
                    current.prompt_version
                ),
                Vec::new(),
            );
        }

        let changed = Self::changed_components(current, previous);
        let all: BTreeSet<String> = self.graph.topological_order().iter().cloned().collect();
        if changed.is_empty() {
            return RebuildPlan {
                to_rebuild: BTreeSet::new(),
                to_skip: all,
                reason: "No input changes; reusing previous outputs".to_string(),
                estimated_duration_ms: 0,
                changed,
            };
        }

        let roots: Vec<String> = changed
            .iter()
            .flat_map(|c| self.graph.change_roots(*c))
            .collect();
        let to_rebuild = self.graph.downstream_closure(&roots);
        let to_skip: BTreeSet<String> = all.difference(&to_rebuild).cloned().collect();

        let names: Vec<String> = changed.iter().map(ToString::to_string).collect();
        let affected: Vec<&str> = self
            .graph
            .topological_order()
            .iter()
            .filter(|id| to_rebuild.contains(*id))
            .map(String::as_str)
            .collect();

        RebuildPlan {
            estimated_duration_ms: self.graph.estimate_ms(&to_rebuild),
            reason: format!(
                "Changed: {}; affected steps: {}",
                names.join(", "),
                affected.join(", ")
            ),
            to_rebuild,
            to_skip,
            changed,
        }
    }
}
