//! Persisted build state.

use crate::cache::content_hash;
use crate::core::{ArtifactStore, PipelineInput};
use crate::graph::InputComponent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Number of build records kept in the history.
pub const MAX_HISTORY: usize = 20;

/// Hashes of the inputs of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDigest {
    /// Hash of the pitch and its metadata.
    pub pitch_hash: String,
    /// Hash of caller-supplied evidence, if any.
    pub evidence_hash: Option<String>,
    /// Prompt version tag in effect.
    pub prompt_version: String,
}

impl InputDigest {
    /// Digests a pipeline input.
    #[must_use]
    pub fn from_input(input: &PipelineInput, prompt_version: &str) -> Self {
        Self {
            pitch_hash: content_hash(&input.pitch_component()),
            evidence_hash: input.evidence.as_ref().map(content_hash),
            prompt_version: prompt_version.to_string(),
        }
    }
}

/// One entry of the build history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// When the build finished.
    pub timestamp: DateTime<Utc>,
    /// Input components that changed.
    pub changed: Vec<InputComponent>,
    /// Steps that were executed.
    pub affected_steps: Vec<String>,
    /// Why they were executed.
    pub reason: String,
}

/// Hashes recorded by the last successful build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildState {
    /// Hash of the pitch component of the input.
    pub pitch_hash: String,
    /// Hash of the evidence the build used.
    #[serde(default)]
    pub evidence_hash: Option<String>,
    /// Hash of each generated section.
    #[serde(default)]
    pub section_hashes: BTreeMap<String, String>,
    /// Hash of the validation output.
    #[serde(default)]
    pub validation_hash: Option<String>,
    /// Hash of the score output.
    #[serde(default)]
    pub score_hash: Option<String>,
    /// Hash of the assembled dossier.
    #[serde(default)]
    pub dossier_hash: Option<String>,
    /// Prompt version the build ran with.
    #[serde(default)]
    pub prompt_version: String,
    /// Last update.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Most recent builds, oldest first.
    #[serde(default)]
    pub history: VecDeque<BuildRecord>,
}

impl BuildState {
    /// Records a successful build on top of the previous state.
    #[must_use]
    pub fn record(
        previous: Option<&Self>,
        digest: &InputDigest,
        artifacts: &ArtifactStore,
        record: BuildRecord,
    ) -> Self {
        let hash_of = |path: &str| artifacts.get(path).map(content_hash);

        let section_hashes = artifacts
            .get("sections")
            .and_then(|v| v.as_object())
            .map(|sections| {
                sections
                    .iter()
                    .map(|(name, value)| (name.clone(), content_hash(value)))
                    .collect()
            })
            .unwrap_or_default();

        let mut history = previous.map(|p| p.history.clone()).unwrap_or_default();
        history.push_back(record);
        while history.len() > MAX_HISTORY {
            history.pop_front();
        }

        Self {
            pitch_hash: digest.pitch_hash.clone(),
            evidence_hash: hash_of("evidence").or_else(|| digest.evidence_hash.clone()),
            section_hashes,
            validation_hash: hash_of("validation"),
            score_hash: hash_of("score"),
            dossier_hash: hash_of("dossier"),
            prompt_version: digest.prompt_version.clone(),
            updated_at: record_time(&history),
            history,
        }
    }

    /// Returns the most recent build record.
    #[must_use]
    pub fn last_record(&self) -> Option<&BuildRecord> {
        self.history.back()
    }
}

fn record_time(history: &VecDeque<BuildRecord>) -> DateTime<Utc> {
    history.back().map_or_else(Utc::now, |r| r.timestamp)
}
