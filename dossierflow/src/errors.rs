//! Error types for the dossierflow engine.
//!
//! The taxonomy separates configuration problems (fatal, never retried),
//! external-service failures (classified for the retry policy), step
//! failures, pipeline timeouts and store I/O problems. Store problems are
//! degraded to cache misses by [`crate::cache::ContentStore`] and only surface
//! here when a caller asks for a record explicitly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The main error type for dossierflow operations.
#[derive(Debug, Error)]
pub enum DossierError {
    /// The step graph or engine configuration is invalid.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// No step could be scheduled although the run is unfinished.
    #[error("Dependency deadlock; stuck steps: {}", stuck.join(", "))]
    DependencyDeadlock {
        /// Steps that were neither completed nor schedulable.
        stuck: Vec<String>,
    },

    /// A step failed and was not tolerant.
    #[error("{0}")]
    StepFailed(#[from] StepError),

    /// The pipeline-level wall clock budget was exhausted.
    #[error("Pipeline timed out after {elapsed_ms}ms")]
    Timeout {
        /// Elapsed run time when the timeout was observed.
        elapsed_ms: u64,
    },

    /// A resume was requested for a run without a checkpoint.
    #[error("No checkpoint found for run '{run_id}'")]
    NoCheckpoint {
        /// The requested run identifier.
        run_id: String,
    },

    /// The run identifier cannot be used as a record key.
    #[error("Invalid run id '{0}'")]
    InvalidRunId(String),

    /// The pipeline input failed validation.
    #[error("Invalid pipeline input: {0}")]
    InvalidInput(String),

    /// The run was cancelled for a reason other than its timeout.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// A store operation failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DossierError {
    /// Returns the coarse kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::DependencyDeadlock { .. } => ErrorKind::DependencyDeadlock,
            Self::StepFailed(_) => ErrorKind::StepFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NoCheckpoint { .. } => ErrorKind::NoCheckpoint,
            Self::InvalidRunId(_) => ErrorKind::InvalidRunId,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Store(_) => ErrorKind::Store,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Returns the step involved, if any.
    #[must_use]
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepFailed(err) => Some(&err.step),
            _ => None,
        }
    }
}

/// Serializable discriminant of [`DossierError`] for result payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed graph or configuration.
    Configuration,
    /// Ready set empty before completion.
    DependencyDeadlock,
    /// A non-tolerant step failed.
    StepFailure,
    /// Pipeline timeout.
    Timeout,
    /// Resume without checkpoint.
    NoCheckpoint,
    /// Unusable run id.
    InvalidRunId,
    /// Rejected input.
    InvalidInput,
    /// Cancellation.
    Cancelled,
    /// Store failure.
    Store,
    /// Serialization failure.
    Serialization,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::DependencyDeadlock => "dependency_deadlock",
            Self::StepFailure => "step_failure",
            Self::Timeout => "timeout",
            Self::NoCheckpoint => "no_checkpoint",
            Self::InvalidRunId => "invalid_run_id",
            Self::InvalidInput => "invalid_input",
            Self::Cancelled => "cancelled",
            Self::Store => "store",
            Self::Serialization => "serialization",
        };
        write!(f, "{s}")
    }
}

/// Error raised when the step graph or configuration is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The steps involved in the error.
    pub steps: Vec<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            steps: Vec::new(),
        }
    }

    /// Sets the steps involved.
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }

    /// Creates an error describing a dependency cycle.
    #[must_use]
    pub fn cycle(cycle_path: Vec<String>) -> Self {
        Self::new(format!(
            "Cycle detected in step graph: {}",
            cycle_path.join(" -> ")
        ))
        .with_steps(cycle_path)
    }
}

/// Whether a failure may be retried and, if so, after what minimum delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off requested by the provider, if any.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

/// Failures reported by the external generative-text service.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GenerationError {
    /// The provider rejected the call because of its rate limit.
    #[error("Rate limited by provider")]
    RateLimited {
        /// Provider supplied retry hint.
        retry_after_ms: Option<u64>,
    },

    /// The call did not finish within the per-call timeout.
    #[error("Call timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout that was exceeded.
        timeout_ms: u64,
    },

    /// The provider failed server-side.
    #[error("Provider server error: {0}")]
    Server(String),

    /// The network request itself failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credentials were missing or rejected.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The request was refused by a content policy.
    #[error("Request rejected by content policy: {0}")]
    PolicyViolation(String),

    /// The prompt does not fit in the model context window.
    #[error("Prompt exceeds model context window: {0}")]
    ContextTooLarge(String),

    /// The response could not be interpreted.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The call was abandoned because the run was cancelled.
    #[error("Call cancelled: {0}")]
    Cancelled(String),
}

impl GenerationError {
    /// Returns the retry policy for this failure.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::RateLimited { retry_after_ms } => RetryPolicy::Retryable {
                after: retry_after_ms.map(Duration::from_millis),
            },
            Self::Timeout { .. } | Self::Server(_) | Self::Transport(_) => {
                RetryPolicy::Retryable { after: None }
            }
            Self::InvalidCredentials(_)
            | Self::PolicyViolation(_)
            | Self::ContextTooLarge(_)
            | Self::InvalidResponse(_)
            | Self::Cancelled(_) => RetryPolicy::NonRetryable,
        }
    }

    /// Returns true if the failure is transient.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.retry_policy(), RetryPolicy::Retryable { .. })
    }
}

impl From<GateError> for GenerationError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Exhausted { .. } => Self::RateLimited {
                retry_after_ms: None,
            },
            GateError::Cancelled(reason) => Self::Cancelled(reason),
        }
    }
}

/// Failures of the token budget gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    /// The window stayed full across every re-reservation attempt.
    #[error("Token budget for model '{model}' still exhausted after {attempts} attempts")]
    Exhausted {
        /// The model identifier.
        model: String,
        /// Number of reservation attempts made.
        attempts: u32,
    },

    /// The wait was interrupted by cancellation.
    #[error("Reservation cancelled: {0}")]
    Cancelled(String),
}

/// Why a step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// Transient failures persisted through every retry.
    RetriesExhausted,
    /// The external service refused the call in a non-retryable way.
    NonRetryable,
    /// The step handler could not prepare or interpret the work.
    Handler,
    /// Declared outputs were missing from the result.
    Contract,
    /// The run was cancelled while the step waited.
    Cancelled,
}

/// Error raised when a single step fails.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Step '{step}' failed after {attempts} attempt(s): {message}")]
pub struct StepError {
    /// The step identifier.
    pub step: String,
    /// The failure description.
    pub message: String,
    /// Number of attempts made.
    pub attempts: u32,
    /// The failure classification.
    pub kind: StepErrorKind,
}

impl StepError {
    /// Creates a new step error.
    #[must_use]
    pub fn new(step: impl Into<String>, kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
            attempts: 0,
            kind,
        }
    }

    /// Sets the attempt count.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Builds a step error from the last external failure.
    #[must_use]
    pub fn from_generation(step: impl Into<String>, err: &GenerationError, attempts: u32) -> Self {
        let kind = match err {
            GenerationError::Cancelled(_) => StepErrorKind::Cancelled,
            e if e.is_retryable() => StepErrorKind::RetriesExhausted,
            _ => StepErrorKind::NonRetryable,
        };
        Self::new(step, kind, err.to_string()).with_attempts(attempts)
    }
}

/// Errors from the cache/checkpoint storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("Record serialization error: {0}")]
    Serialization(String),

    /// The backend rejected the operation.
    #[error("Backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_message() {
        let err = ConfigurationError::cycle(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> a"));
        assert_eq!(err.steps.len(), 3);
    }

    #[test]
    fn test_generation_error_retry_classes() {
        assert!(GenerationError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(GenerationError::RateLimited { retry_after_ms: None }.is_retryable());
        assert!(GenerationError::Server("502".into()).is_retryable());
        assert!(!GenerationError::InvalidCredentials("bad key".into()).is_retryable());
        assert!(!GenerationError::PolicyViolation("blocked".into()).is_retryable());
        assert!(!GenerationError::ContextTooLarge("too long".into()).is_retryable());
    }

    #[test]
    fn test_rate_limit_hint_is_kept() {
        let policy = GenerationError::RateLimited {
            retry_after_ms: Some(1500),
        }
        .retry_policy();

        assert_eq!(
            policy,
            RetryPolicy::Retryable {
                after: Some(Duration::from_millis(1500))
            }
        );
    }

    #[test]
    fn test_step_error_from_generation() {
        let err = StepError::from_generation("market", &GenerationError::Timeout { timeout_ms: 5 }, 3);
        assert_eq!(err.kind, StepErrorKind::RetriesExhausted);
        assert_eq!(err.attempts, 3);

        let err = StepError::from_generation(
            "market",
            &GenerationError::ContextTooLarge("x".into()),
            1,
        );
        assert_eq!(err.kind, StepErrorKind::NonRetryable);
    }

    #[test]
    fn test_dossier_error_kind() {
        let err = DossierError::NoCheckpoint {
            run_id: "run-1".into(),
        };
        assert_eq!(err.kind(), ErrorKind::NoCheckpoint);
        assert_eq!(err.kind().to_string(), "no_checkpoint");
    }
}
