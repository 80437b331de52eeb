//! Step handlers: what a step computes or asks the service for.
//!
//! The prompts are deliberately generic. Business content of each section is
//! owned by the prompt library of the boundary service; the engine only
//! needs a deterministic request per input and a way to read the answer.

use crate::graph::StepDefinition;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Inputs of a step keyed by binding name.
pub type StepInputs = Map<String, Value>;

/// Outputs of a step keyed by binding name.
pub type StepOutputs = Map<String, Value>;

/// Prompt text for one external call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptParts {
    /// Optional system prompt.
    pub system: Option<String>,
    /// The user prompt.
    pub user: String,
}

/// What a step needs to do for the given inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum StepWork {
    /// Outputs computed locally; no external call.
    Computed(StepOutputs),
    /// An external call is needed.
    Generate(PromptParts),
}

/// Per-step behavior plugged into the executor.
pub trait StepHandler: Send + Sync + Debug {
    /// Decides the work for a set of inputs.
    ///
    /// # Errors
    ///
    /// Returns a message if the inputs cannot be used.
    fn prepare(&self, step: &StepDefinition, inputs: &StepInputs) -> Result<StepWork, String>;

    /// Turns the service response into outputs.
    ///
    /// # Errors
    ///
    /// Returns a message if the response cannot be used.
    fn interpret(
        &self,
        step: &StepDefinition,
        inputs: &StepInputs,
        response: &str,
    ) -> Result<StepOutputs, String>;

    /// Content used when a tolerant step fails and no previous output exists.
    fn assumptions(&self, step: &StepDefinition, _inputs: &StepInputs) -> StepOutputs {
        step.outputs
            .iter()
            .map(|b| {
                (
                    b.name.clone(),
                    json!({
                        "assumed": true,
                        "summary": format!("{} could not be generated; to be completed manually", step.name),
                    }),
                )
            })
            .collect()
    }
}

fn parse_response(response: &str) -> Value {
    let trimmed = response.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map_or(trimmed, str::trim);
    serde_json::from_str(unfenced).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

/// Generic handler: one JSON prompt in, one JSON answer out.
#[derive(Debug, Clone)]
pub struct PromptHandler {
    system: String,
}

impl Default for PromptHandler {
    fn default() -> Self {
        Self {
            system: "You are an analyst preparing an investor dossier. \
                     Answer with a single JSON object and nothing else."
                .to_string(),
        }
    }
}

impl PromptHandler {
    /// Creates a handler with a custom system prompt.
    #[must_use]
    pub fn with_system(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
        }
    }
}

impl StepHandler for PromptHandler {
    fn prepare(&self, step: &StepDefinition, inputs: &StepInputs) -> Result<StepWork, String> {
        let inputs_json = serde_json::to_string_pretty(inputs).map_err(|e| e.to_string())?;
        let expected: Vec<&str> = step.outputs.iter().map(|b| b.name.as_str()).collect();
        Ok(StepWork::Generate(PromptParts {
            system: Some(self.system.clone()),
            user: format!(
                "Task: {}\nProduce: {}\n\nInputs:\n{inputs_json}",
                step.name,
                expected.join(", ")
            ),
        }))
    }

    fn interpret(
        &self,
        step: &StepDefinition,
        _inputs: &StepInputs,
        response: &str,
    ) -> Result<StepOutputs, String> {
        let value = parse_response(response);
        match step.outputs.as_slice() {
            [single] => {
                let mut outputs = Map::new();
                outputs.insert(single.name.clone(), value);
                Ok(outputs)
            }
            many => {
                let Value::Object(mut object) = value else {
                    return Err(format!("expected an object with {} fields", many.len()));
                };
                many.iter()
                    .map(|b| {
                        object
                            .remove(&b.name)
                            .map(|v| (b.name.clone(), v))
                            .ok_or_else(|| format!("response is missing '{}'", b.name))
                    })
                    .collect()
            }
        }
    }
}

/// Normalizes the caller input into the `pitch` artifact.
#[derive(Debug, Clone, Copy, Default)]
pub struct PitchIntakeHandler;

impl StepHandler for PitchIntakeHandler {
    fn prepare(&self, _step: &StepDefinition, inputs: &StepInputs) -> Result<StepWork, String> {
        let input = inputs.get("input").ok_or("missing input")?;
        let text = input
            .get("pitchText")
            .and_then(Value::as_str)
            .map(str::trim)
            .ok_or("input has no pitch text")?;
        let field = |name: &str| input.get(name).cloned().unwrap_or(Value::Null);

        let mut outputs = Map::new();
        outputs.insert(
            "pitch".to_string(),
            json!({
                "title": field("title"),
                "text": text,
                "language": input.get("language").cloned().unwrap_or_else(|| json!("en")),
                "targetAudience": field("targetAudience"),
                "geo": field("geo"),
                "wordCount": text.split_whitespace().count(),
            }),
        );
        Ok(StepWork::Computed(outputs))
    }

    fn interpret(&self, _: &StepDefinition, _: &StepInputs, _: &str) -> Result<StepOutputs, String> {
        Err("pitch intake does not call the service".to_string())
    }
}

/// Assembles the final dossier from validated sections.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssembleHandler;

impl StepHandler for AssembleHandler {
    fn prepare(&self, step: &StepDefinition, inputs: &StepInputs) -> Result<StepWork, String> {
        let input = inputs.get("input").ok_or("missing input")?;
        let sections: Map<String, Value> = step
            .inputs
            .iter()
            .filter(|b| b.path.starts_with("sections."))
            .filter_map(|b| inputs.get(&b.name).map(|v| (b.name.clone(), v.clone())))
            .collect();

        let mut outputs = Map::new();
        outputs.insert(
            "dossier".to_string(),
            json!({
                "title": input.get("title").cloned().unwrap_or(Value::Null),
                "language": input.get("language").cloned().unwrap_or_else(|| json!("en")),
                "sections": sections,
                "validation": inputs.get("validation").cloned().unwrap_or(Value::Null),
                "score": inputs.get("score").cloned().unwrap_or(Value::Null),
            }),
        );
        Ok(StepWork::Computed(outputs))
    }

    fn interpret(&self, _: &StepDefinition, _: &StepInputs, _: &str) -> Result<StepOutputs, String> {
        Err("assembly does not call the service".to_string())
    }
}

/// Handlers by step id, with a generic default.
#[derive(Debug, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    default: Arc<dyn StepHandler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            default: Arc::new(PromptHandler::default()),
        }
    }
}

impl HandlerRegistry {
    /// Creates a registry where every step uses the generic handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the registry for the dossier graph.
    #[must_use]
    pub fn dossier() -> Self {
        Self::new()
            .with_handler("pitch_intake", Arc::new(PitchIntakeHandler))
            .with_handler("assemble", Arc::new(AssembleHandler))
    }

    /// Registers a handler for a step.
    #[must_use]
    pub fn with_handler(mut self, step_id: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(step_id.into(), handler);
        self
    }

    /// Returns the handler for a step.
    #[must_use]
    pub fn get(&self, step_id: &str) -> Arc<dyn StepHandler> {
        self.handlers
            .get(step_id)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::dossier_graph;

    fn inputs(pairs: &[(&str, Value)]) -> StepInputs {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_pitch_intake_normalizes() {
        let graph = dossier_graph().unwrap();
        let step = graph.step("pitch_intake").unwrap();
        let work = PitchIntakeHandler
            .prepare(
                step,
                &inputs(&[("input", json!({"title": "Acme", "pitchText": "  Rockets for all  "}))]),
            )
            .unwrap();

        let StepWork::Computed(outputs) = work else {
            panic!("expected computed work");
        };
        assert_eq!(outputs["pitch"]["text"], "Rockets for all");
        assert_eq!(outputs["pitch"]["language"], "en");
        assert_eq!(outputs["pitch"]["wordCount"], 3);
    }

    #[test]
    fn test_prompt_is_deterministic() {
        let graph = dossier_graph().unwrap();
        let step = graph.step("market").unwrap();
        let handler = PromptHandler::default();
        let i = inputs(&[("brief", json!({"b": 1, "a": 2}))]);

        assert_eq!(handler.prepare(step, &i).unwrap(), handler.prepare(step, &i).unwrap());
    }

    #[test]
    fn test_interpret_json_and_text() {
        let graph = dossier_graph().unwrap();
        let step = graph.step("market").unwrap();
        let handler = PromptHandler::default();

        let outputs = handler
            .interpret(step, &StepInputs::new(), "```json\n{\"tam\": 10}\n```")
            .unwrap();
        assert_eq!(outputs["market"], json!({"tam": 10}));

        let outputs = handler.interpret(step, &StepInputs::new(), "plain words").unwrap();
        assert_eq!(outputs["market"], json!("plain words"));
    }

    #[test]
    fn test_assumptions_cover_outputs() {
        let graph = dossier_graph().unwrap();
        let step = graph.step("team").unwrap();
        let outputs = PromptHandler::default().assumptions(step, &StepInputs::new());
        assert_eq!(outputs["team"]["assumed"], true);
    }

    #[test]
    fn test_registry_falls_back_to_prompt_handler() {
        let registry = HandlerRegistry::dossier();
        let graph = dossier_graph().unwrap();
        let step = graph.step("assemble").unwrap();

        assert!(matches!(
            registry.get("assemble").prepare(step, &inputs(&[("input", json!({"title": "Acme"}))])),
            Ok(StepWork::Computed(_))
        ));
        assert!(matches!(
            registry.get("gtm").prepare(graph.step("gtm").unwrap(), &StepInputs::new()),
            Ok(StepWork::Generate(_))
        ));
    }
}
