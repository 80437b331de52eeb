//! Step definitions.

use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Model tier preferred by an external step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Cheap, fast model.
    Fast,
    /// Stronger model for analysis.
    Reasoning,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Reasoning => write!(f, "reasoning"),
        }
    }
}

/// A named input or output addressed by artifact path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    /// Name seen by the step handler.
    pub name: String,
    /// Artifact path (`brief` or `sections.market`).
    pub path: String,
}

impl Binding {
    /// Creates a binding.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Creates a binding whose name is the last path segment.
    #[must_use]
    pub fn at(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = path.rsplit('.').next().unwrap_or(path.as_str()).to_string();
        Self { name, path }
    }
}

/// Definition of a single step in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Identifiers of the steps this one depends on.
    pub dependencies: Vec<String>,
    /// Named inputs read from the artifact store.
    pub inputs: Vec<Binding>,
    /// Named outputs written to the artifact store.
    pub outputs: Vec<Binding>,
    /// Whether the step calls the external service.
    pub external: bool,
    /// Preferred model tier for external steps.
    pub model: Option<ModelTier>,
    /// Checkpoint before launching this step.
    pub critical: bool,
    /// Substitute a fallback payload instead of failing the run.
    pub tolerant: bool,
    /// Step-level version tag mixed into cache keys.
    pub version: String,
    /// Expected run time, for plan estimates only.
    pub estimated_ms: u64,
}

impl StepDefinition {
    /// Creates a pure-computation step with no dependencies.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            dependencies: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            external: false,
            model: None,
            critical: false,
            tolerant: false,
            version: "1".to_string(),
            estimated_ms: 1_000,
        }
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an input read from `path`, named after its last segment.
    #[must_use]
    pub fn reads(mut self, path: impl Into<String>) -> Self {
        self.inputs.push(Binding::at(path));
        self
    }

    /// Adds an output written to `path`, named after its last segment.
    #[must_use]
    pub fn writes(mut self, path: impl Into<String>) -> Self {
        self.outputs.push(Binding::at(path));
        self
    }

    /// Marks the step as an external call with a preferred tier.
    #[must_use]
    pub fn external(mut self, tier: ModelTier) -> Self {
        self.external = true;
        self.model = Some(tier);
        self
    }

    /// Marks the step as critical.
    #[must_use]
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Marks the step as tolerant.
    #[must_use]
    pub fn tolerant(mut self) -> Self {
        self.tolerant = true;
        self
    }

    /// Sets the version tag.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the duration estimate.
    #[must_use]
    pub fn with_estimated_ms(mut self, ms: u64) -> Self {
        self.estimated_ms = ms;
        self
    }

    /// Validates the definition in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error if the step depends on itself, declares no outputs,
    /// or repeats a binding name.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.id.trim().is_empty() {
            return Err(ConfigurationError::new("Step id cannot be empty"));
        }
        if self.dependencies.iter().any(|d| d == &self.id) {
            return Err(ConfigurationError::new(format!(
                "Step '{}' cannot depend on itself",
                self.id
            ))
            .with_steps(vec![self.id.clone()]));
        }
        if self.outputs.is_empty() {
            return Err(ConfigurationError::new(format!(
                "Step '{}' declares no outputs",
                self.id
            ))
            .with_steps(vec![self.id.clone()]));
        }
        for bindings in [&self.inputs, &self.outputs] {
            let mut names: Vec<&str> = bindings.iter().map(|b| b.name.as_str()).collect();
            names.sort_unstable();
            if names.windows(2).any(|w| w[0] == w[1]) {
                return Err(ConfigurationError::new(format!(
                    "Step '{}' repeats a binding name",
                    self.id
                ))
                .with_steps(vec![self.id.clone()]));
            }
        }
        if self.external && self.model.is_none() {
            return Err(ConfigurationError::new(format!(
                "External step '{}' has no model tier",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_at_uses_last_segment() {
        assert_eq!(Binding::at("sections.market").name, "market");
        assert_eq!(Binding::at("brief").name, "brief");
    }

    #[test]
    fn test_builder() {
        let step = StepDefinition::new("market", "Market analysis")
            .with_dependencies(["brief"])
            .reads("brief")
            .writes("sections.market")
            .external(ModelTier::Reasoning)
            .critical();

        assert_eq!(step.dependencies, vec!["brief".to_string()]);
        assert!(step.external);
        assert!(step.critical);
        assert!(!step.tolerant);
        assert!(step.validate().is_ok());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let step = StepDefinition::new("a", "A")
            .with_dependencies(["a"])
            .writes("a");
        assert!(step.validate().is_err());
    }

    #[test]
    fn test_missing_outputs_rejected() {
        let step = StepDefinition::new("a", "A");
        assert!(step.validate().is_err());
    }

    #[test]
    fn test_duplicate_binding_names_rejected() {
        let step = StepDefinition::new("a", "A")
            .reads("sections.market")
            .reads("market")
            .writes("a");
        assert!(step.validate().is_err());
    }
}
