//! Token budget gate for the external generative service.
//!
//! Each model gets a fixed window with a token limit. A reservation that
//! does not fit waits until the window resets and then tries again against
//! the fresh window, since concurrent callers may have consumed it first.

use crate::config::TokenLimitConfig;
use crate::errors::GateError;
use crate::pipeline::CancellationToken;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Estimates the token count of a text.
///
/// Three characters per token, rounded up. Deliberately overestimates for
/// typical English prose.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    (chars + 2) / 3
}

/// Per-model usage in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    /// Tokens admitted in the current window.
    pub used: u64,
    /// When the current window ends.
    pub reset_at: Instant,
    /// Limit applied to the current window.
    pub limit: u64,
}

impl TokenBudget {
    fn fresh(now: Instant, window: Duration, limit: u64) -> Self {
        Self {
            used: 0,
            reset_at: now + window,
            limit,
        }
    }
}

/// Counters for gate activity.
#[derive(Debug, Default)]
pub struct GateMetrics {
    admitted: AtomicU64,
    waits: AtomicU64,
    waited_ms: AtomicU64,
    tokens: AtomicU64,
}

impl GateMetrics {
    /// Returns the number of admitted reservations.
    #[must_use]
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Returns how many times a caller had to wait.
    #[must_use]
    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }

    /// Returns the total time spent waiting.
    #[must_use]
    pub fn waited_ms(&self) -> u64 {
        self.waited_ms.load(Ordering::Relaxed)
    }

    /// Returns the total tokens admitted.
    #[must_use]
    pub fn tokens(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    /// Converts metrics to a JSON object.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "admitted": self.admitted(),
            "waits": self.waits(),
            "waited_ms": self.waited_ms(),
            "tokens": self.tokens(),
        })
    }
}

enum Admission {
    Granted,
    Wait(Duration),
}

/// Sliding-window admission controller keyed by model identifier.
///
/// Constructed once and shared by handle; budgets are created lazily per
/// model on first use.
#[derive(Debug)]
pub struct TokenBudgetGate {
    budgets: Mutex<HashMap<String, TokenBudget>>,
    window: Duration,
    safety_buffer: Duration,
    max_attempts: u32,
    metrics: GateMetrics,
}

impl TokenBudgetGate {
    /// Creates a gate.
    #[must_use]
    pub fn new(window: Duration, safety_buffer: Duration, max_attempts: u32) -> Self {
        Self {
            budgets: Mutex::new(HashMap::new()),
            window,
            safety_buffer,
            max_attempts: max_attempts.max(1),
            metrics: GateMetrics::default(),
        }
    }

    /// Creates a gate from token limit settings.
    #[must_use]
    pub fn from_config(config: &TokenLimitConfig) -> Self {
        Self::new(
            config.window(),
            config.safety_buffer(),
            config.max_reservation_attempts,
        )
    }

    /// Returns the gate metrics.
    #[must_use]
    pub fn metrics(&self) -> &GateMetrics {
        &self.metrics
    }

    /// Returns a snapshot of a model's current budget.
    #[must_use]
    pub fn budget(&self, model: &str) -> Option<TokenBudget> {
        self.budgets.lock().get(model).copied()
    }

    fn try_admit(&self, model: &str, estimated_tokens: u64, limit: u64) -> Admission {
        let now = Instant::now();
        let mut budgets = self.budgets.lock();
        let budget = budgets
            .entry(model.to_string())
            .or_insert_with(|| TokenBudget::fresh(now, self.window, limit));

        if now >= budget.reset_at {
            *budget = TokenBudget::fresh(now, self.window, limit);
        }
        budget.limit = limit;

        // An oversized request still gets through on an empty window.
        let fits = budget.used + estimated_tokens <= limit;
        if fits || budget.used == 0 {
            budget.used += estimated_tokens;
            return Admission::Granted;
        }

        Admission::Wait(budget.reset_at.saturating_duration_since(now) + self.safety_buffer)
    }

    /// Reserves `estimated_tokens` for `model`, waiting for window resets as
    /// needed.
    ///
    /// Returns the total time waited.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Exhausted`] if the window is still full after
    /// `max_attempts` waits, or [`GateError::Cancelled`] if `cancel` fired while waiting.
    pub async fn reserve(
        &self,
        model: &str,
        estimated_tokens: u64,
        limit: u64,
        cancel: &CancellationToken,
    ) -> Result<Duration, GateError> {
        let started = Instant::now();

        for attempt in 0..=self.max_attempts {
            match self.try_admit(model, estimated_tokens, limit) {
                Admission::Granted => {
                    let waited = started.elapsed();
                    self.metrics.admitted.fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .tokens
                        .fetch_add(estimated_tokens, Ordering::Relaxed);
                    if !waited.is_zero() {
                        self.metrics
                            .waited_ms
                            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
                    }
                    return Ok(waited);
                }
                Admission::Wait(wait) if attempt < self.max_attempts => {
                    self.metrics.waits.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        model,
                        attempt,
                        estimated_tokens,
                        wait_ms = wait.as_millis() as u64,
                        "Token budget full, waiting for window reset"
                    );
                    cancel.sleep(wait).await.map_err(GateError::Cancelled)?;
                }
                Admission::Wait(_) => break,
            }
        }

        warn!(model, attempts = self.max_attempts, "Token budget still exhausted");
        Err(GateError::Exhausted {
            model: model.to_string(),
            attempts: self.max_attempts,
        })
    }
}
