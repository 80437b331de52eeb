//! The step dependency graph.
//!
//! This module provides:
//! - Step definitions with artifact-addressed inputs and outputs
//! - Graph validation (unknown dependencies, cycles, unresolvable inputs)
//! - The forward dependency table used for rebuild closures
//! - The fixed dossier graph

mod definition;
mod dossier;

pub use definition::{Binding, ModelTier, StepDefinition};
pub use dossier::{dossier_graph, DOSSIER_CHANGE_ROOTS, DOSSIER_DOWNSTREAM, DOSSIER_STEP_IDS};

use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

/// Artifact keys seeded by the scheduler before any step runs.
pub const SEED_KEYS: &[&str] = &["input", "evidence"];

/// A pipeline input whose change can invalidate steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputComponent {
    /// The free-form pitch and its metadata.
    Pitch,
    /// Harvested evidence content.
    Evidence,
}

impl fmt::Display for InputComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pitch => write!(f, "pitch"),
            Self::Evidence => write!(f, "evidence"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// A validated, immutable directed acyclic graph of steps.
#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: Vec<StepDefinition>,
    index: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    order: Vec<String>,
    change_roots: HashMap<InputComponent, Vec<String>>,
}

impl StepGraph {
    /// Builds and validates a graph.
    ///
    /// The forward dependency table is derived from the declarations; use
    /// [`StepGraph::with_dependents_table`] to pin a static one.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate ids, unknown dependencies, cycles,
    /// colliding outputs, or inputs no dependency produces.
    pub fn new(steps: Vec<StepDefinition>) -> Result<Self, ConfigurationError> {
        if steps.is_empty() {
            return Err(ConfigurationError::new("Step graph cannot be empty"));
        }

        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            step.validate()?;
            if index.insert(step.id.clone(), i).is_some() {
                return Err(ConfigurationError::new(format!("Duplicate step id '{}'", step.id))
                    .with_steps(vec![step.id.clone()]));
            }
        }

        for step in &steps {
            for dep in &step.dependencies {
                if !index.contains_key(dep) {
                    return Err(ConfigurationError::new(format!(
                        "Step '{}' depends on unknown step '{dep}'",
                        step.id
                    ))
                    .with_steps(vec![step.id.clone(), dep.clone()]));
                }
            }
        }

        let order = topological_sort(&steps, &index)?;

        let mut dependents: HashMap<String, Vec<String>> =
            steps.iter().map(|s| (s.id.clone(), Vec::new())).collect();
        for step in &steps {
            for dep in &step.dependencies {
                if let Some(children) = dependents.get_mut(dep) {
                    children.push(step.id.clone());
                }
            }
        }

        let graph = Self {
            steps,
            index,
            dependents,
            order,
            change_roots: HashMap::new(),
        };
        graph.validate_bindings()?;
        Ok(graph)
    }

    fn validate_bindings(&self) -> Result<(), ConfigurationError> {
        let mut producers: HashMap<&str, &str> = HashMap::new();
        for step in &self.steps {
            for output in &step.outputs {
                if let Some(other) = producers.insert(output.path.as_str(), step.id.as_str()) {
                    return Err(ConfigurationError::new(format!(
                        "Output '{}' is written by both '{other}' and '{}'",
                        output.path, step.id
                    ))
                    .with_steps(vec![other.to_string(), step.id.clone()]));
                }
            }
        }

        for step in &self.steps {
            let ancestors = self.ancestors(&step.id);
            for input in &step.inputs {
                match producers.get(input.path.as_str()) {
                    Some(producer) if ancestors.contains(*producer) => {}
                    Some(producer) => {
                        return Err(ConfigurationError::new(format!(
                            "Step '{}' reads '{}' but does not depend on its producer '{producer}'",
                            step.id, input.path
                        ))
                        .with_steps(vec![step.id.clone(), (*producer).to_string()]));
                    }
                    None => {
                        let root = input.path.split('.').next().unwrap_or_default();
                        if !SEED_KEYS.contains(&root) {
                            return Err(ConfigurationError::new(format!(
                                "Step '{}' reads '{}' which no step produces",
                                step.id, input.path
                            ))
                            .with_steps(vec![step.id.clone()]));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Replaces the derived forward table with a static one.
    ///
    /// # Errors
    ///
    /// Returns an error if the table disagrees with the declared dependencies.
    pub fn with_dependents_table(mut self, table: &[(&str, &[&str])]) -> Result<Self, ConfigurationError> {
        let mut pinned: HashMap<String, Vec<String>> = HashMap::with_capacity(self.steps.len());
        for (step, children) in table {
            if !self.index.contains_key(*step) {
                return Err(ConfigurationError::new(format!(
                    "Dependency table names unknown step '{step}'"
                )));
            }
            pinned.insert(
                (*step).to_string(),
                children.iter().map(|c| (*c).to_string()).collect(),
            );
        }

        for step in &self.steps {
            let derived: HashSet<&String> = self.dependents[&step.id].iter().collect();
            let declared: HashSet<&String> = pinned
                .get(&step.id)
                .map(|c| c.iter().collect())
                .unwrap_or_default();
            if derived != declared {
                return Err(ConfigurationError::new(format!(
                    "Dependency table disagrees with declarations for '{}'",
                    step.id
                ))
                .with_steps(vec![step.id.clone()]));
            }
            pinned.entry(step.id.clone()).or_default();
        }

        self.dependents = pinned;
        Ok(self)
    }

    /// Declares the steps first invalidated when `component` changes.
    ///
    /// # Errors
    ///
    /// Returns an error if a root is not a step of this graph.
    pub fn with_change_roots(
        mut self,
        component: InputComponent,
        roots: &[&str],
    ) -> Result<Self, ConfigurationError> {
        for root in roots {
            if !self.index.contains_key(*root) {
                return Err(ConfigurationError::new(format!(
                    "Change root '{root}' for {component} is not a step"
                )));
            }
        }
        self.change_roots
            .insert(component, roots.iter().map(|r| (*r).to_string()).collect());
        Ok(self)
    }

    /// Returns a step by id.
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    /// Returns the steps in declaration order.
    #[must_use]
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the graph has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the step ids in topological order.
    #[must_use]
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Iterates step definitions in topological order.
    pub fn steps_in_order(&self) -> impl Iterator<Item = &StepDefinition> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.index.get(id).map(|&i| &self.steps[i]))
    }

    /// Returns the direct dependents of a step.
    #[must_use]
    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns the roots invalidated by a component change.
    ///
    /// Components without declared roots invalidate every step.
    #[must_use]
    pub fn change_roots(&self, component: InputComponent) -> Vec<String> {
        self.change_roots
            .get(&component)
            .cloned()
            .unwrap_or_else(|| self.order.clone())
    }

    /// Returns `roots` plus every step reachable from them.
    #[must_use]
    pub fn downstream_closure<'a, I>(&self, roots: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut closure = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        for root in roots {
            if closure.insert(root.clone()) {
                queue.push_back(root.as_str());
            }
        }
        while let Some(current) = queue.pop_front() {
            for child in self.dependents(current) {
                if closure.insert(child.clone()) {
                    queue.push_back(child.as_str());
                }
            }
        }
        closure
    }

    /// Returns every transitive dependency of a step.
    #[must_use]
    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(step) = self.step(current) {
                for dep in &step.dependencies {
                    if seen.insert(dep.clone()) {
                        stack.push(dep.as_str());
                    }
                }
            }
        }
        seen
    }

    /// Sums the duration estimates of the given steps.
    #[must_use]
    pub fn estimate_ms<'a, I>(&self, ids: I) -> u64
    where
        I: IntoIterator<Item = &'a String>,
    {
        ids.into_iter()
            .filter_map(|id| self.step(id))
            .map(|s| s.estimated_ms)
            .sum()
    }
}

fn topological_sort(
    steps: &[StepDefinition],
    index: &HashMap<String, usize>,
) -> Result<Vec<String>, ConfigurationError> {
    fn visit(
        i: usize,
        steps: &[StepDefinition],
        index: &HashMap<String, usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        order: &mut Vec<String>,
    ) -> Result<(), ConfigurationError> {
        match marks[i] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                let start = stack.iter().position(|&s| s == i).unwrap_or(0);
                let mut path: Vec<String> = stack[start..]
                    .iter()
                    .map(|&s| steps[s].id.clone())
                    .collect();
                path.push(steps[i].id.clone());
                return Err(ConfigurationError::cycle(path));
            }
            Mark::Unvisited => {}
        }

        marks[i] = Mark::Visiting;
        stack.push(i);
        for dep in &steps[i].dependencies {
            if let Some(&d) = index.get(dep) {
                visit(d, steps, index, marks, stack, order)?;
            }
        }
        stack.pop();
        marks[i] = Mark::Done;
        order.push(steps[i].id.clone());
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; steps.len()];
    let mut stack = Vec::new();
    let mut order = Vec::with_capacity(steps.len());

    // Declaration order keeps the result deterministic.
    for i in 0..steps.len() {
        visit(i, steps, index, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}
