//! The content-addressable cache and checkpoint store.

use super::backend::{CacheBackend, FileBackend, InMemoryBackend};
use super::entry::{CacheEntry, CacheMetadata, EntryKind};
use super::jobs::{JobRecord, JobStatus};
use super::keys::{self, CacheKeyFlags};
use crate::config::{EngineConfig, JobRetentionConfig};
use crate::errors::StoreError;
use crate::pipeline::Checkpoint;
use crate::rebuild::BuildState;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const BUILD_STATE_KEY: &str = "build_state";

fn output_key(step_id: &str) -> String {
    format!("output:{step_id}")
}

fn artifact_key(run_id: &str) -> String {
    format!("artifact:{run_id}")
}

fn checkpoint_key(run_id: &str) -> String {
    format!("checkpoint:{run_id}")
}

fn job_key(job_id: &str) -> String {
    format!("job:{job_id}")
}

/// Counters for store activity.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
}

impl StoreMetrics {
    /// Returns cache hits.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns cache misses, including degraded reads.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns successful writes.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns evicted entries.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Returns backend errors that were degraded.
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Snapshot of store contents and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Total records.
    pub entries: usize,
    /// Records per kind.
    pub by_kind: BTreeMap<String, usize>,
    /// Configured capacity for evictable records.
    pub capacity: usize,
    /// Cache hits.
    pub hits: u64,
    /// Cache misses.
    pub misses: u64,
    /// Writes.
    pub writes: u64,
    /// Evictions.
    pub evictions: u64,
    /// Degraded backend errors.
    pub errors: u64,
}

/// Cache, checkpoint, build-state and job-record storage over one backend.
///
/// Backend failures never propagate: reads degrade to misses and writes to
/// no-ops, each with a warning.
pub struct ContentStore {
    backend: Arc<dyn CacheBackend>,
    capacity: usize,
    metrics: StoreMetrics,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("capacity", &self.capacity)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl ContentStore {
    /// Creates a store over a backend. A capacity of zero disables eviction.
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>, capacity: usize) -> Self {
        Self {
            backend,
            capacity,
            metrics: StoreMetrics::default(),
        }
    }

    /// Creates a process-local store.
    #[must_use]
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), capacity)
    }

    /// Creates a store persisted under `root`.
    #[must_use]
    pub fn file(root: impl Into<PathBuf>, capacity: usize) -> Self {
        Self::new(Arc::new(FileBackend::new(root)), capacity)
    }

    /// Creates a file store from the engine configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::file(config.cache_dir.clone(), config.cache_capacity)
    }

    /// Returns the store metrics.
    #[must_use]
    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    fn degraded(&self, op: &str, key: &str, err: &StoreError) {
        self.metrics.errors.fetch_add(1, Ordering::Relaxed);
        warn!(op, key, error = %err, "Store operation failed; continuing without it");
    }

    /// Returns the full entry for a key.
    pub async fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        match self.backend.read(key).await {
            Ok(Some(entry)) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Ok(None) => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                self.degraded("read", key, &e);
                None
            }
        }
    }

    /// Returns the payload for a key.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.get_entry(key).await.map(|e| e.value)
    }

    /// Returns true if a record exists for a key.
    pub async fn has(&self, key: &str) -> bool {
        match self.backend.read(key).await {
            Ok(entry) => entry.is_some(),
            Err(e) => {
                self.degraded("has", key, &e);
                false
            }
        }
    }

    /// Stores a record. Returns true if it was persisted.
    pub async fn set(&self, key: &str, value: Value, metadata: CacheMetadata) -> bool {
        let evictable = metadata.kind.is_evictable();
        let entry = CacheEntry::new(key, value, metadata);
        if let Err(e) = self.backend.write(&entry).await {
            self.degraded("write", key, &e);
            return false;
        }
        self.metrics.writes.fetch_add(1, Ordering::Relaxed);
        if evictable {
            self.enforce_capacity().await;
        }
        true
    }

    /// Deletes a record. Returns true if one was removed.
    pub async fn delete(&self, key: &str) -> bool {
        match self.backend.remove(key).await {
            Ok(removed) => removed,
            Err(e) => {
                self.degraded("delete", key, &e);
                false
            }
        }
    }

    /// Derives the cache key for a step execution.
    #[must_use]
    pub fn create_step_cache_key(
        &self,
        step_id: &str,
        inputs: &Value,
        version: &str,
        flags: &CacheKeyFlags,
    ) -> String {
        keys::create_step_cache_key(step_id, inputs, version, flags)
    }

    async fn list(&self) -> Vec<(String, CacheMetadata)> {
        match self.backend.list().await {
            Ok(records) => records,
            Err(e) => {
                self.degraded("list", "*", &e);
                Vec::new()
            }
        }
    }

    async fn enforce_capacity(&self) {
        if self.capacity == 0 {
            return;
        }
        let mut evictable: Vec<(String, CacheMetadata)> = self
            .list()
            .await
            .into_iter()
            .filter(|(_, meta)| meta.kind.is_evictable())
            .collect();
        if evictable.len() <= self.capacity {
            return;
        }

        evictable.sort_by(|a, b| a.1.cached_at.cmp(&b.1.cached_at).then_with(|| a.0.cmp(&b.0)));
        let excess = evictable.len() - self.capacity;
        for (key, _) in evictable.into_iter().take(excess) {
            if self.delete(&key).await {
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Evicted cache entry");
            }
        }
    }

    async fn read_record<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                self.degraded("decode", key, &StoreError::Serialization(e.to_string()));
                None
            }
        }
    }

    async fn write_record<T: Serialize>(&self, key: &str, record: &T, metadata: CacheMetadata) -> bool {
        match serde_json::to_value(record) {
            Ok(value) => self.set(key, value, metadata).await,
            Err(e) => {
                self.degraded("encode", key, &StoreError::Serialization(e.to_string()));
                false
            }
        }
    }

    /// Saves the last outputs of a step.
    pub async fn save_step_output(&self, step_id: &str, outputs: &Value) -> bool {
        self.set(
            &output_key(step_id),
            outputs.clone(),
            CacheMetadata::new(EntryKind::StepOutput).with_step(step_id),
        )
        .await
    }

    /// Loads the last outputs of a step.
    pub async fn load_step_output(&self, step_id: &str) -> Option<Value> {
        self.get(&output_key(step_id)).await
    }

    /// Saves the final artifact of a run.
    pub async fn save_artifact(&self, run_id: &str, artifact: &Value) -> bool {
        self.set(
            &artifact_key(run_id),
            artifact.clone(),
            CacheMetadata::new(EntryKind::Artifact),
        )
        .await
    }

    /// Loads the final artifact of a run.
    pub async fn load_artifact(&self, run_id: &str) -> Option<Value> {
        self.get(&artifact_key(run_id)).await
    }

    /// Saves a checkpoint under its run id.
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> bool {
        let key = checkpoint_key(&checkpoint.run_id);
        let saved = self
            .write_record(&key, checkpoint, CacheMetadata::new(EntryKind::Checkpoint))
            .await;
        if saved {
            debug!(run_id = %checkpoint.run_id, "Checkpoint saved");
        }
        saved
    }

    /// Loads the checkpoint of a run.
    pub async fn load_checkpoint(&self, run_id: &str) -> Option<Checkpoint> {
        self.read_record(&checkpoint_key(run_id)).await
    }

    /// Deletes the checkpoint of a run.
    pub async fn delete_checkpoint(&self, run_id: &str) -> bool {
        let removed = self.delete(&checkpoint_key(run_id)).await;
        if removed {
            debug!(run_id, "Checkpoint deleted");
        }
        removed
    }

    /// Loads the build state of the last successful build.
    pub async fn load_build_state(&self) -> Option<BuildState> {
        self.read_record(BUILD_STATE_KEY).await
    }

    /// Replaces the build state.
    pub async fn save_build_state(&self, state: &BuildState) -> bool {
        self.write_record(BUILD_STATE_KEY, state, CacheMetadata::new(EntryKind::BuildState))
            .await
    }

    /// Writes a job record.
    pub async fn put_job(&self, job: &JobRecord) -> bool {
        self.write_record(&job_key(&job.job_id), job, CacheMetadata::new(EntryKind::JobRecord))
            .await
    }

    /// Reads a job record.
    pub async fn get_job(&self, job_id: &str) -> Option<JobRecord> {
        self.read_record(&job_key(job_id)).await
    }

    /// Deletes finished job records older than their retention.
    ///
    /// Queued and running jobs are never removed. Returns the number deleted.
    pub async fn sweep_job_records(&self, retention: &JobRetentionConfig, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for (key, meta) in self.list().await {
            if meta.kind != EntryKind::JobRecord {
                continue;
            }
            let Some(job) = self.read_record::<JobRecord>(&key).await else {
                continue;
            };
            let keep_secs = match job.status {
                JobStatus::Queued | JobStatus::Running => continue,
                JobStatus::Completed => retention.completed_secs,
                JobStatus::Failed => retention.failed_secs,
            };
            let age_secs = (now - job.updated_at).num_seconds().max(0) as u64;
            if age_secs >= keep_secs && self.delete(&key).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Swept expired job records");
        }
        removed
    }

    /// Deletes every evictable record (step results, step outputs and
    /// artifacts). Returns the number deleted.
    pub async fn clear(&self) -> usize {
        let mut removed = 0;
        for (key, meta) in self.list().await {
            if meta.kind.is_evictable() && self.delete(&key).await {
                removed += 1;
            }
        }
        removed
    }

    /// Deletes evictable records written more than `max_age` ago.
    pub async fn expire_older_than(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };

        let mut removed = 0;
        for (key, meta) in self.list().await {
            if meta.kind.is_evictable() && meta.cached_at < cutoff && self.delete(&key).await {
                removed += 1;
            }
        }
        removed
    }

    /// Returns a snapshot of contents and counters.
    pub async fn stats(&self) -> CacheStats {
        let records = self.list().await;
        let mut by_kind = BTreeMap::new();
        for (_, meta) in &records {
            let name = serde_json::to_value(meta.kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *by_kind.entry(name).or_insert(0) += 1;
        }

        CacheStats {
            entries: records.len(),
            by_kind,
            capacity: self.capacity,
            hits: self.metrics.hits(),
            misses: self.metrics.misses(),
            writes: self.metrics.writes(),
            evictions: self.metrics.evictions(),
            errors: self.metrics.errors(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FailingBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn result_meta(at: DateTime<Utc>) -> CacheMetadata {
        CacheMetadata::new(EntryKind::StepResult).with_cached_at(at)
    }

    #[tokio::test]
    async fn test_get_set_has() {
        let store = ContentStore::in_memory(10);
        let key = store.create_step_cache_key("brief", &json!({"a": 1}), "v1", &CacheKeyFlags::live());

        assert!(store.get(&key).await.is_none());
        assert!(store.set(&key, json!({"brief": "x"}), CacheMetadata::new(EntryKind::StepResult)).await);
        assert!(store.has(&key).await);
        assert_eq!(store.get(&key).await, Some(json!({"brief": "x"})));
        assert_eq!(store.metrics().hits(), 1);
        assert_eq!(store.metrics().misses(), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_evictable() {
        let store = ContentStore::in_memory(2);
        let base = Utc::now() - chrono::Duration::minutes(10);

        store
            .set("checkpoint:run", json!({}), CacheMetadata::new(EntryKind::Checkpoint).with_cached_at(base))
            .await;
        for i in 0..3 {
            store
                .set(
                    &format!("step:s:{i}"),
                    json!(i),
                    result_meta(base + chrono::Duration::seconds(i)),
                )
                .await;
        }

        assert!(!store.has("step:s:0").await);
        assert!(store.has("step:s:1").await);
        assert!(store.has("step:s:2").await);
        assert!(store.has("checkpoint:run").await);
        assert_eq!(store.metrics().evictions(), 1);
    }

    #[tokio::test]
    async fn test_backend_failures_degrade() {
        let store = ContentStore::new(Arc::new(FailingBackend), 10);

        assert!(store.get("k").await.is_none());
        assert!(!store.set("k", json!(1), CacheMetadata::new(EntryKind::StepResult)).await);
        assert!(store.load_checkpoint("run").await.is_none());
        assert!(!store.delete_checkpoint("run").await);
        assert!(store.metrics().errors() >= 4);
    }

    #[tokio::test]
    async fn test_undecodable_record_is_a_miss() {
        let store = ContentStore::in_memory(10);
        store
            .set("build_state", json!("not a build state"), CacheMetadata::new(EntryKind::BuildState))
            .await;

        assert!(store.load_build_state().await.is_none());
    }

    #[tokio::test]
    async fn test_step_output_roundtrip() {
        let store = ContentStore::in_memory(10);
        store.save_step_output("market", &json!({"market": {"tam": 5}})).await;

        assert_eq!(
            store.load_step_output("market").await,
            Some(json!({"market": {"tam": 5}}))
        );
        assert!(store.load_step_output("gtm").await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_keeps_active_jobs() {
        let store = ContentStore::in_memory(10);
        let retention = JobRetentionConfig::default();
        let old = Utc::now() - chrono::Duration::days(30);

        let mut queued = JobRecord::queued("q");
        queued.updated_at = old;
        let mut running = JobRecord::queued("r").running();
        running.updated_at = old;
        let mut done = JobRecord::queued("d").completed(json!({}));
        done.updated_at = old;
        let fresh_failure = JobRecord::queued("f").failed("boom");

        for job in [&queued, &running, &done, &fresh_failure] {
            assert!(store.put_job(job).await);
        }

        let removed = store.sweep_job_records(&retention, Utc::now()).await;

        assert_eq!(removed, 1);
        assert!(store.get_job("q").await.is_some());
        assert!(store.get_job("r").await.is_some());
        assert!(store.get_job("d").await.is_none());
        assert!(store.get_job("f").await.is_some());
    }

    #[tokio::test]
    async fn test_jobs_are_never_evicted_by_capacity() {
        let store = ContentStore::in_memory(1);
        store.put_job(&JobRecord::queued("q")).await;
        store.set("step:a:1", json!(1), CacheMetadata::new(EntryKind::StepResult)).await;
        store.set("step:a:2", json!(2), CacheMetadata::new(EntryKind::StepResult)).await;

        assert!(store.get_job("q").await.is_some());
    }

    #[tokio::test]
    async fn test_clear_and_expire() {
        let store = ContentStore::in_memory(0);
        let old = Utc::now() - chrono::Duration::hours(2);

        store.set("step:a:1", json!(1), result_meta(old)).await;
        store.set("step:a:2", json!(2), CacheMetadata::new(EntryKind::StepResult)).await;
        store.put_job(&JobRecord::queued("q")).await;

        assert_eq!(store.expire_older_than(Duration::from_secs(3600)).await, 1);
        assert!(store.has("step:a:2").await);

        assert_eq!(store.clear().await, 1);
        let stats = store.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.by_kind.get("job_record"), Some(&1));
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        ContentStore::file(dir.path(), 10)
            .save_artifact("run-1", &json!({"dossier": "done"}))
            .await;

        let reopened = ContentStore::file(dir.path(), 10);
        assert_eq!(
            reopened.load_artifact("run-1").await,
            Some(json!({"dossier": "done"}))
        );
    }
}
