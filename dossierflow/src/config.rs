//! Engine configuration.
//!
//! Everything the engine needs to know about models, budgets, timeouts and
//! storage is resolved once into an [`EngineConfig`] and handed down to the
//! scheduler and executor. Nothing reads the environment after construction.

use crate::errors::ConfigurationError;
use crate::executor::RetryConfig;
use crate::graph::ModelTier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Concrete model identifiers for each tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model used for cheap extraction steps.
    #[serde(default = "default_fast_model")]
    pub fast: String,
    /// Model used for analysis and scoring steps.
    #[serde(default = "default_reasoning_model")]
    pub reasoning: String,
}

fn default_fast_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

fn default_reasoning_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            fast: default_fast_model(),
            reasoning: default_reasoning_model(),
        }
    }
}

impl ModelConfig {
    /// Resolves a tier to a model identifier.
    #[must_use]
    pub fn resolve(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast,
            ModelTier::Reasoning => &self.reasoning,
        }
    }
}

/// Token budget settings for the rate gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLimitConfig {
    /// Tokens per window for models without an explicit limit.
    #[serde(default = "default_token_limit")]
    pub default_limit: u64,
    /// Per-model overrides.
    #[serde(default)]
    pub per_model: HashMap<String, u64>,
    /// Window length in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Extra wait added after a window reset.
    #[serde(default = "default_safety_buffer_ms")]
    pub safety_buffer_ms: u64,
    /// Re-reservation attempts before giving up.
    #[serde(default = "default_max_reservation_attempts")]
    pub max_reservation_attempts: u32,
}

fn default_token_limit() -> u64 {
    30_000
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_safety_buffer_ms() -> u64 {
    250
}

fn default_max_reservation_attempts() -> u32 {
    8
}

impl Default for TokenLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: default_token_limit(),
            per_model: HashMap::new(),
            window_ms: default_window_ms(),
            safety_buffer_ms: default_safety_buffer_ms(),
            max_reservation_attempts: default_max_reservation_attempts(),
        }
    }
}

impl TokenLimitConfig {
    /// Returns the window limit for a model.
    #[must_use]
    pub fn limit_for(&self, model: &str) -> u64 {
        self.per_model
            .get(model)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Returns the window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Returns the post-reset safety buffer.
    #[must_use]
    pub fn safety_buffer(&self) -> Duration {
        Duration::from_millis(self.safety_buffer_ms)
    }
}

/// Retention for job records kept alongside cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRetentionConfig {
    /// How long completed job records are kept, in seconds.
    #[serde(default = "default_completed_retention")]
    pub completed_secs: u64,
    /// How long failed job records are kept, in seconds.
    #[serde(default = "default_failed_retention")]
    pub failed_secs: u64,
}

fn default_completed_retention() -> u64 {
    24 * 60 * 60
}

fn default_failed_retention() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for JobRetentionConfig {
    fn default() -> Self {
        Self {
            completed_secs: default_completed_retention(),
            failed_secs: default_failed_retention(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for cache, checkpoint and build-state records.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Prompt/version tag mixed into every cache key.
    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,
    /// Skip the external service and produce stub content.
    #[serde(default)]
    pub dry_run: bool,
    /// Model identifiers per tier.
    #[serde(default)]
    pub models: ModelConfig,
    /// Rate gate settings.
    #[serde(default)]
    pub token_limits: TokenLimitConfig,
    /// Per-call timeout for the external service, in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Retry policy for transient external failures.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Default number of steps run concurrently.
    #[serde(default = "default_parallel_limit")]
    pub parallel_limit: usize,
    /// Default overall run timeout in milliseconds.
    #[serde(default = "default_pipeline_timeout_ms")]
    pub pipeline_timeout_ms: Option<u64>,
    /// Maximum number of evictable cache entries.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Completed steps between periodic checkpoints.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    /// Output token ceiling for external calls.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Sampling temperature for external calls.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Job record retention.
    #[serde(default)]
    pub job_retention: JobRetentionConfig,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".dossier-cache")
}

fn default_prompt_version() -> String {
    "v1".to_string()
}

fn default_call_timeout_ms() -> u64 {
    25_000
}

fn default_parallel_limit() -> usize {
    2
}

#[allow(clippy::unnecessary_wraps)]
fn default_pipeline_timeout_ms() -> Option<u64> {
    Some(10 * 60 * 1000)
}

fn default_cache_capacity() -> usize {
    500
}

fn default_checkpoint_every() -> usize {
    2
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            prompt_version: default_prompt_version(),
            dry_run: false,
            models: ModelConfig::default(),
            token_limits: TokenLimitConfig::default(),
            call_timeout_ms: default_call_timeout_ms(),
            retry: RetryConfig::default(),
            parallel_limit: default_parallel_limit(),
            pipeline_timeout_ms: default_pipeline_timeout_ms(),
            cache_capacity: default_cache_capacity(),
            checkpoint_every: default_checkpoint_every(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            job_retention: JobRetentionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from `DOSSIER_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigurationError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("DOSSIER_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(version) = lookup("DOSSIER_PROMPT_VERSION") {
            config.prompt_version = version;
        }
        if let Some(model) = lookup("DOSSIER_MODEL_FAST") {
            config.models.fast = model;
        }
        if let Some(model) = lookup("DOSSIER_MODEL_REASONING") {
            config.models.reasoning = model;
        }
        if let Some(dry_run) = parse_var::<bool, _>(&lookup, "DOSSIER_DRY_RUN")? {
            config.dry_run = dry_run;
        }
        if let Some(limit) = parse_var(&lookup, "DOSSIER_TOKEN_LIMIT")? {
            config.token_limits.default_limit = limit;
        }
        if let Some(window) = parse_var(&lookup, "DOSSIER_TOKEN_WINDOW_MS")? {
            config.token_limits.window_ms = window;
        }
        if let Some(timeout) = parse_var(&lookup, "DOSSIER_CALL_TIMEOUT_MS")? {
            config.call_timeout_ms = timeout;
        }
        if let Some(attempts) = parse_var::<u32, _>(&lookup, "DOSSIER_MAX_RETRIES")? {
            config.retry.max_attempts = attempts.saturating_add(1);
        }
        if let Some(jitter) = parse_var::<bool, _>(&lookup, "DOSSIER_RETRY_JITTER")? {
            config.retry.jitter = jitter;
        }
        if let Some(limit) = parse_var(&lookup, "DOSSIER_PARALLEL_LIMIT")? {
            config.parallel_limit = limit;
        }
        if let Some(timeout) = parse_var(&lookup, "DOSSIER_PIPELINE_TIMEOUT_MS")? {
            config.pipeline_timeout_ms = Some(timeout);
        }
        if let Some(capacity) = parse_var(&lookup, "DOSSIER_CACHE_CAPACITY")? {
            config.cache_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.parallel_limit == 0 {
            return Err(ConfigurationError::new("parallel_limit must be at least 1"));
        }
        if self.token_limits.default_limit == 0 {
            return Err(ConfigurationError::new("token limit must be positive"));
        }
        if self.token_limits.window_ms == 0 {
            return Err(ConfigurationError::new("token window must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigurationError::new("retry.max_attempts must be at least 1"));
        }
        if self.prompt_version.trim().is_empty() {
            return Err(ConfigurationError::new("prompt_version cannot be empty"));
        }
        Ok(())
    }

    /// Sets the cache directory.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Sets the prompt version tag.
    #[must_use]
    pub fn with_prompt_version(mut self, version: impl Into<String>) -> Self {
        self.prompt_version = version.into();
        self
    }

    /// Enables or disables dry-run mode.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the token limit settings.
    #[must_use]
    pub fn with_token_limits(mut self, limits: TokenLimitConfig) -> Self {
        self.token_limits = limits;
        self
    }

    /// Sets the default parallelism.
    #[must_use]
    pub fn with_parallel_limit(mut self, limit: usize) -> Self {
        self.parallel_limit = limit;
        self
    }

    /// Sets how many completed steps trigger a periodic checkpoint.
    #[must_use]
    pub fn with_checkpoint_every(mut self, steps: usize) -> Self {
        self.checkpoint_every = steps;
        self
    }

    /// Sets the cache capacity.
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets the default pipeline timeout; `None` disables it.
    #[must_use]
    pub fn with_pipeline_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pipeline_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Returns the per-call timeout.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Returns the default pipeline timeout.
    #[must_use]
    pub fn pipeline_timeout(&self) -> Option<Duration> {
        self.pipeline_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_var<T, L>(lookup: &L, name: &str) -> Result<Option<T>, ConfigurationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    L: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ConfigurationError::new(format!("{name}: cannot parse '{raw}': {e}"))
        }),
    }
}
