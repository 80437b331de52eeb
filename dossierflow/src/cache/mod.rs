//! Content-addressable cache and checkpoint store.
//!
//! This module provides:
//! - Deterministic cache keys over canonical JSON
//! - Pluggable storage backends (in-memory, one file per record)
//! - [`ContentStore`], which layers cache, checkpoint, build-state and
//!   job-record operations over a backend and degrades I/O failures to misses

mod backend;
mod entry;
mod jobs;
mod keys;
mod store;

pub use backend::{CacheBackend, FileBackend, InMemoryBackend};
pub use entry::{CacheEntry, CacheMetadata, EntryKind};
pub use jobs::{JobRecord, JobStatus};
pub use keys::{canonical_json, content_hash, create_step_cache_key, sha256_hex, CacheKeyFlags};
pub use store::{CacheStats, ContentStore, StoreMetrics};
