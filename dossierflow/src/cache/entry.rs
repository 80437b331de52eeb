//! Stored records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a stored record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A cached step result keyed by content hash.
    StepResult,
    /// The last outputs of a step, reloaded when it is skipped.
    StepOutput,
    /// A final artifact of a successful run.
    Artifact,
    /// A resumable run snapshot.
    Checkpoint,
    /// The build state of the last successful build.
    BuildState,
    /// A job record for the boundary job queue.
    JobRecord,
}

impl EntryKind {
    /// Returns true if capacity eviction may remove this kind of entry.
    #[must_use]
    pub fn is_evictable(&self) -> bool {
        matches!(self, Self::StepResult | Self::StepOutput | Self::Artifact)
    }
}

/// Metadata stored alongside every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// When the record was written.
    pub cached_at: DateTime<Utc>,
    /// The record kind.
    pub kind: EntryKind,
    /// The step that produced the record, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl CacheMetadata {
    /// Creates metadata stamped with the current time.
    #[must_use]
    pub fn new(kind: EntryKind) -> Self {
        Self {
            cached_at: Utc::now(),
            kind,
            step_id: None,
        }
    }

    /// Sets the producing step.
    #[must_use]
    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Overrides the timestamp.
    #[must_use]
    pub fn with_cached_at(mut self, cached_at: DateTime<Utc>) -> Self {
        self.cached_at = cached_at;
        self
    }
}

/// A key mapped to a payload and its metadata.
///
/// Entries are never mutated in place; a write replaces the whole record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The record key.
    pub key: String,
    /// The payload.
    pub value: Value,
    /// Record metadata.
    pub metadata: CacheMetadata,
}

impl CacheEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(key: impl Into<String>, value: Value, metadata: CacheMetadata) -> Self {
        Self {
            key: key.into(),
            value,
            metadata,
        }
    }
}
