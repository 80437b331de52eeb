//! The pipeline input supplied by the boundary service.

use crate::errors::DossierError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Input for one dossier build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInput {
    /// Project title.
    pub title: String,
    /// Free-form pitch text. The primary input.
    pub pitch_text: String,
    /// Output language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Intended readers of the dossier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_audience: Option<String>,
    /// Geographic focus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<String>,
    /// Pre-harvested evidence. When present it replaces the harvest call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Value>,
}

impl PipelineInput {
    /// Creates an input from a title and pitch text.
    #[must_use]
    pub fn new(title: impl Into<String>, pitch_text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            pitch_text: pitch_text.into(),
            language: None,
            target_audience: None,
            geo: None,
            evidence: None,
        }
    }

    /// Sets the language.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Sets the target audience.
    #[must_use]
    pub fn with_target_audience(mut self, audience: impl Into<String>) -> Self {
        self.target_audience = Some(audience.into());
        self
    }

    /// Sets the geographic focus.
    #[must_use]
    pub fn with_geo(mut self, geo: impl Into<String>) -> Self {
        self.geo = Some(geo.into());
        self
    }

    /// Supplies pre-harvested evidence.
    #[must_use]
    pub fn with_evidence(mut self, evidence: Value) -> Self {
        self.evidence = Some(evidence);
        self
    }

    /// Validates required fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the title or pitch text is blank.
    pub fn validate(&self) -> Result<(), DossierError> {
        if self.title.trim().is_empty() {
            return Err(DossierError::InvalidInput("title cannot be empty".into()));
        }
        if self.pitch_text.trim().is_empty() {
            return Err(DossierError::InvalidInput("pitch text cannot be empty".into()));
        }
        Ok(())
    }

    /// Returns the input without evidence, as hashed for change detection.
    #[must_use]
    pub fn pitch_component(&self) -> Value {
        let mut pitch = self.clone();
        pitch.evidence = None;
        serde_json::to_value(pitch).unwrap_or(Value::Null)
    }
}
