//! The external generative-text service, seen from the engine.

use crate::errors::GenerationError;
use crate::gate::estimate_tokens;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One call to the generative service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Concrete model identifier.
    pub model: String,
    /// Optional system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// The user prompt.
    pub user_prompt: String,
    /// Output token cap.
    pub max_output_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl GenerationRequest {
    /// Creates a request with default sampling settings.
    #[must_use]
    pub fn new(model: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            user_prompt: user_prompt.into(),
            max_output_tokens: 4096,
            temperature: 0.4,
        }
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the output token cap.
    #[must_use]
    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    /// Sets the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Estimated tokens charged against the budget: prompt plus output cap.
    #[must_use]
    pub fn estimated_tokens(&self) -> u64 {
        let system = self.system_prompt.as_deref().map_or(0, estimate_tokens);
        system + estimate_tokens(&self.user_prompt) + u64::from(self.max_output_tokens)
    }
}

/// A function from (model, prompts, parameters) to text.
///
/// Implementations classify their failures so the executor can tell
/// transient errors from permanent ones.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerativeClient: Send + Sync {
    /// Performs one call.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}
