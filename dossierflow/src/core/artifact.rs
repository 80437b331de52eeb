//! The per-run artifact store.
//!
//! Artifacts are addressed by key, optionally one level deep
//! (`sections.market` lives at `sections` → `market`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mapping from artifact key to structured output.
///
/// Grows monotonically during a run as steps complete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactStore {
    values: Map<String, Value>,
}

fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, tail)) => (head, Some(tail)),
        None => (path, None),
    }
}

impl ArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value at a path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        match split_path(path) {
            (key, None) => self.values.get(key),
            (key, Some(field)) => self.values.get(key)?.as_object()?.get(field),
        }
    }

    /// Returns true if a value exists at a path.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Inserts a value at a path, creating the parent object if needed.
    ///
    /// A non-object parent is replaced by an object.
    pub fn insert(&mut self, path: &str, value: Value) {
        match split_path(path) {
            (key, None) => {
                self.values.insert(key.to_string(), value);
            }
            (key, Some(field)) => {
                let parent = self
                    .values
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !parent.is_object() {
                    *parent = Value::Object(Map::new());
                }
                if let Value::Object(map) = parent {
                    map.insert(field.to_string(), value);
                }
            }
        }
    }

    /// Inserts a value only if the path is vacant.
    ///
    /// Returns true if the value was inserted.
    pub fn insert_if_absent(&mut self, path: &str, value: Value) -> bool {
        if self.contains(path) {
            return false;
        }
        self.insert(path, value);
        true
    }

    /// Returns the number of top-level keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the store as a JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}
