//! Canonical hashing and cache key derivation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Environment flags that change what a step produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKeyFlags {
    /// Dry-run results must never be served to live runs.
    pub dry_run: bool,
    /// Concrete model identifier used by the step, if external.
    pub model: Option<String>,
}

impl CacheKeyFlags {
    /// Flags for a live run.
    #[must_use]
    pub fn live() -> Self {
        Self::default()
    }

    /// Sets the dry-run flag.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets the model identifier.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Serializes a JSON value with object keys sorted at every depth.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

/// Returns the hex SHA-256 of a string.
#[must_use]
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Returns the content hash of a JSON value, independent of key order.
#[must_use]
pub fn content_hash(value: &Value) -> String {
    sha256_hex(&canonical_json(value))
}

/// Derives the cache key for one execution of a step.
///
/// A pure function of the step id, the canonical inputs, the version tag and
/// the flags. The step id is kept readable in the key prefix.
#[must_use]
pub fn create_step_cache_key(
    step_id: &str,
    inputs: &Value,
    version: &str,
    flags: &CacheKeyFlags,
) -> String {
    let material = json!({
        "step": step_id,
        "inputs": inputs,
        "version": version,
        "flags": {
            "dry_run": flags.dry_run,
            "model": flags.model,
        },
    });
    format!("step:{step_id}:{}", content_hash(&material))
}
