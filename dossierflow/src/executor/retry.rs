//! Retry with capped exponential backoff.
//!
//! Retries are driven by a [`RetryPolicy`] classifier so that only transient
//! failures consume attempts; everything else returns on the first error.

use crate::errors::RetryPolicy;
use crate::pipeline::CancellationToken;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the initial one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Draws each delay uniformly from zero to the backoff value.
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    8000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Enables or disables full jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Attempts made by one retry loop.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Number of attempts made so far.
    pub attempt: u32,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no attempts remain.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.attempt >= config.max_attempts
    }

    /// Calculates the delay before the next attempt.
    ///
    /// The first retry waits `base`, doubling up to `max_delay_ms`.
    #[must_use]
    pub fn calculate_delay(&self, config: &RetryConfig) -> Duration {
        let retry_index = self.attempt.saturating_sub(1);
        let delay = config
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(retry_index))
            .min(config.max_delay_ms);

        if config.jitter && delay > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=delay))
        } else {
            Duration::from_millis(delay)
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Makes a retry decision after a failed attempt.
///
/// A server-supplied retry hint is honored when it is longer than the
/// backoff delay.
#[must_use]
pub fn should_retry(state: &RetryState, config: &RetryConfig, policy: &RetryPolicy) -> RetryDecision {
    let after = match policy {
        RetryPolicy::NonRetryable => return RetryDecision::NotRetryable,
        RetryPolicy::Retryable { after } => *after,
    };

    if state.is_exhausted(config) {
        return RetryDecision::GiveUp;
    }

    let delay = state.calculate_delay(config);
    RetryDecision::Retry(after.map_or(delay, |hint| hint.max(delay)))
}

/// Result of [`with_retry`] together with the number of attempts made.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The final result.
    pub result: Result<T, E>,
    /// Attempts made, including the initial one.
    pub attempts: u32,
}

/// Executes an operation with retry logic.
///
/// `classify` decides whether a failure is transient. Backoff sleeps end early
/// when `cancel` fires, returning the last error.
pub async fn with_retry<T, E, F, Fut, C>(
    config: &RetryConfig,
    key: &str,
    cancel: &CancellationToken,
    classify: C,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryPolicy,
    E: std::fmt::Display,
{
    let mut state = RetryState::new();

    loop {
        state.attempt += 1;
        match operation().await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: state.attempt,
                }
            }
            Err(e) => match should_retry(&state, config, &classify(&e)) {
                RetryDecision::Retry(delay) => {
                    tracing::debug!(
                        key,
                        attempt = state.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient error"
                    );
                    if cancel.sleep(delay).await.is_err() {
                        return RetryOutcome {
                            result: Err(e),
                            attempts: state.attempt,
                        };
                    }
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: state.attempt,
                    };
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn transient(_: &String) -> RetryPolicy {
        RetryPolicy::Retryable { after: None }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 8000);
        assert!(!config.jitter);
    }

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::new()
            .with_max_attempts(0)
            .with_base_delay_ms(500)
            .with_max_delay_ms(10000)
            .with_jitter(true);

        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.base_delay_ms, 500);
        assert_eq!(config.max_delay_ms, 10000);
        assert!(config.jitter);
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(350);
        let mut state = RetryState::new();

        state.attempt = 1;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(100));
        state.attempt = 2;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(200));
        state.attempt = 3;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(350));
        state.attempt = 40;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_below_backoff() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(1000)
            .with_jitter(true);
        let state = RetryState { attempt: 2 };

        for _ in 0..20 {
            assert!(state.calculate_delay(&config) <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_should_retry_respects_policy() {
        let config = RetryConfig::new().with_max_attempts(3);
        let mut state = RetryState::new();
        state.attempt = 1;

        assert_eq!(
            should_retry(&state, &config, &RetryPolicy::NonRetryable),
            RetryDecision::NotRetryable
        );

        let decision = should_retry(
            &state,
            &config,
            &RetryPolicy::Retryable {
                after: Some(Duration::from_secs(5)),
            },
        );
        assert_eq!(decision, RetryDecision::Retry(Duration::from_secs(5)));

        state.attempt = 3;
        assert_eq!(
            should_retry(&state, &config, &RetryPolicy::Retryable { after: None }),
            RetryDecision::GiveUp
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_success_after_failures() {
        let config = RetryConfig::new().with_base_delay_ms(10);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let outcome = with_retry(&config, "test", &cancel, transient, move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n}"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(outcome.result, Ok(42));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_gives_up_after_max_attempts() {
        let config = RetryConfig::new().with_max_attempts(3).with_base_delay_ms(10);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let outcome: RetryOutcome<(), String> =
            with_retry(&config, "test", &cancel, transient, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("always fails".to_string())
                }
            })
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_stops_when_cancelled() {
        let config = RetryConfig::new().with_max_attempts(5).with_base_delay_ms(1000);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let token = cancel.clone();
        let outcome: RetryOutcome<(), String> =
            with_retry(&config, "test", &cancel, transient, move || {
                let counter = counter.clone();
                let token = token.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    token.cancel("shutdown");
                    Err("busy".to_string())
                }
            })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_non_retryable_fails_immediately() {
        let config = RetryConfig::new().with_max_attempts(5);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let outcome: RetryOutcome<(), String> = with_retry(
            &config,
            "test",
            &cancel,
            |_: &String| RetryPolicy::NonRetryable,
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("bad credentials".to_string())
                }
            },
        )
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
