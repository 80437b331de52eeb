//! Messages-API client over reqwest.

use crate::errors::GenerationError;
use crate::executor::{GenerationRequest, GenerativeClient};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// API version header value.
const API_VERSION: &str = "2023-06-01";

/// Environment variable holding the API key.
pub const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: [ApiMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Classifies a non-success HTTP response.
///
/// `retry_after` is the raw `retry-after` header in seconds, if present.
#[must_use]
pub fn classify_status(status: u16, body: &str, retry_after: Option<&str>) -> GenerationError {
    let lower = body.to_ascii_lowercase();
    match status {
        429 => GenerationError::RateLimited {
            retry_after_ms: retry_after
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(|s| (s * 1000.0) as u64),
        },
        401 | 403 => GenerationError::InvalidCredentials(format!("HTTP {status}")),
        400 | 413
            if lower.contains("context")
                || lower.contains("too long")
                || lower.contains("too many tokens")
                || status == 413 =>
        {
            GenerationError::ContextTooLarge(body.to_string())
        }
        400 if lower.contains("policy") || lower.contains("safety") => {
            GenerationError::PolicyViolation(body.to_string())
        }
        408 => GenerationError::Timeout { timeout_ms: 0 },
        500..=599 => GenerationError::Server(format!("HTTP {status}: {body}")),
        _ => GenerationError::InvalidResponse(format!("HTTP {status}: {body}")),
    }
}

/// Extracts the text of a Messages-API response body.
///
/// # Errors
///
/// Returns [`GenerationError::InvalidResponse`] when the body is not a
/// Messages response or carries no text.
pub fn extract_text(body: &str) -> Result<String, GenerationError> {
    let response: MessagesResponse =
        serde_json::from_str(body).map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;
    let text: String = response
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect();
    if text.is_empty() {
        Err(GenerationError::InvalidResponse("response has no text content".to_string()))
    } else {
        Ok(text)
    }
}

/// HTTP client for a Messages-style generative API.
#[derive(Clone)]
pub struct HttpGenerativeClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for HttpGenerativeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGenerativeClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpGenerativeClient {
    /// Creates a client with an explicit key.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Creates a client from `ANTHROPIC_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`GenerationError::InvalidCredentials`] when the variable is
    /// unset or empty.
    pub fn from_env() -> Result<Self, GenerationError> {
        match std::env::var(API_KEY_VAR) {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key)),
            _ => Err(GenerationError::InvalidCredentials(format!("{API_KEY_VAR} is not set"))),
        }
    }

    /// Overrides the base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl GenerativeClient for HttpGenerativeClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            system: request.system_prompt.as_deref(),
            messages: [ApiMessage {
                role: "user",
                content: &request.user_prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout { timeout_ms: 0 }
                } else {
                    GenerationError::Transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response
            .text()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        if !(200..300).contains(&status) {
            let error = classify_status(status, &text, retry_after.as_deref());
            warn!(model = %request.model, status, error = %error, "Generation request failed");
            return Err(error);
        }
        debug!(model = %request.model, bytes = text.len(), "Generation response received");
        extract_text(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(
            classify_status(429, "", Some("2")),
            GenerationError::RateLimited { retry_after_ms: Some(2000) }
        );
        assert_eq!(
            classify_status(429, "", None),
            GenerationError::RateLimited { retry_after_ms: None }
        );
        assert!(matches!(classify_status(401, "", None), GenerationError::InvalidCredentials(_)));
        assert!(matches!(classify_status(403, "", None), GenerationError::InvalidCredentials(_)));
        assert!(matches!(
            classify_status(400, "prompt is too long: 210000 tokens", None),
            GenerationError::ContextTooLarge(_)
        ));
        assert!(matches!(
            classify_status(400, "Output blocked by content policy", None),
            GenerationError::PolicyViolation(_)
        ));
        assert!(matches!(classify_status(529, "overloaded", None), GenerationError::Server(_)));
        assert!(matches!(classify_status(404, "", None), GenerationError::InvalidResponse(_)));
    }

    #[test]
    fn test_classification_drives_retry() {
        assert!(classify_status(503, "", None).is_retryable());
        assert!(classify_status(429, "", None).is_retryable());
        assert!(!classify_status(400, "maximum context length exceeded", None).is_retryable());
        assert!(!classify_status(401, "", None).is_retryable());
    }

    #[test]
    fn test_extract_text() {
        let body = r#"{"content":[{"type":"text","text":"{\"a\":"},{"type":"text","text":"1}"}]}"#;
        assert_eq!(extract_text(body).unwrap(), r#"{"a":1}"#);
        assert!(extract_text(r#"{"content":[]}"#).is_err());
        assert!(extract_text("not json").is_err());
    }

    #[test]
    fn test_request_serialization() {
        let body = MessagesRequest {
            model: "m",
            max_tokens: 10,
            temperature: 0.5,
            system: None,
            messages: [ApiMessage {
                role: "user",
                content: "hi",
            }],
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("system").is_none());
        assert_eq!(value["messages"][0]["role"], "user");
    }
}
