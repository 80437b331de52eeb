//! Runs one step: cache probe, gated external call with timeout and retry,
//! output validation and cache write.

use super::client::{GenerationRequest, GenerativeClient};
use super::handler::{HandlerRegistry, PromptParts, StepInputs, StepOutputs, StepWork};
use super::retry::{with_retry, RetryOutcome};
use crate::cache::{content_hash, CacheKeyFlags, CacheMetadata, ContentStore, EntryKind};
use crate::config::EngineConfig;
use crate::errors::{GenerationError, StepError, StepErrorKind};
use crate::events::{names, EventSink};
use crate::gate::TokenBudgetGate;
use crate::graph::StepDefinition;
use crate::observability::SpanTimer;
use crate::pipeline::CancellationToken;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of running one step.
#[derive(Debug, Clone)]
pub struct StepRunResult {
    /// Whether the step produced all of its outputs.
    pub success: bool,
    /// Outputs keyed by binding name.
    pub data: Option<StepOutputs>,
    /// The failure, if any.
    pub error: Option<StepError>,
    /// Run time in milliseconds.
    pub duration_ms: u64,
    /// Whether the outputs came from the cache.
    pub cache_hit: bool,
    /// Content hash of the outputs.
    pub hash: Option<String>,
    /// Attempts made (zero for cache hits).
    pub attempts: u32,
    /// The cache key the result is stored under.
    pub cache_key: String,
}

impl StepRunResult {
    fn failed(error: StepError, duration_ms: u64, cache_key: String) -> Self {
        Self {
            success: false,
            data: None,
            attempts: error.attempts,
            error: Some(error),
            duration_ms,
            cache_hit: false,
            hash: None,
            cache_key,
        }
    }
}

fn declared_outputs_present(step: &StepDefinition, outputs: &StepOutputs) -> Result<(), String> {
    let missing: Vec<&str> = step
        .outputs
        .iter()
        .filter(|b| !outputs.contains_key(&b.name))
        .map(|b| b.name.as_str())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("missing declared outputs: {}", missing.join(", ")))
    }
}

/// Executes single steps on behalf of the scheduler.
pub struct StepExecutor {
    store: Arc<ContentStore>,
    gate: Arc<TokenBudgetGate>,
    client: Arc<dyn GenerativeClient>,
    handlers: Arc<HandlerRegistry>,
    config: Arc<EngineConfig>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("dry_run", &self.config.dry_run)
            .field("prompt_version", &self.config.prompt_version)
            .finish_non_exhaustive()
    }
}

impl StepExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        store: Arc<ContentStore>,
        gate: Arc<TokenBudgetGate>,
        client: Arc<dyn GenerativeClient>,
        handlers: Arc<HandlerRegistry>,
        config: Arc<EngineConfig>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            gate,
            client,
            handlers,
            config,
            events,
        }
    }

    /// Resolves the concrete model of an external step.
    #[must_use]
    pub fn model_for(&self, step: &StepDefinition) -> Option<String> {
        step.model.map(|tier| self.config.models.resolve(tier).to_string())
    }

    /// Derives the cache key for a step and its inputs.
    #[must_use]
    pub fn cache_key(&self, step: &StepDefinition, inputs: &StepInputs) -> String {
        let mut flags = CacheKeyFlags::live().with_dry_run(self.config.dry_run);
        if let Some(model) = self.model_for(step) {
            flags = flags.with_model(model);
        }
        let version = format!("{}:{}", self.config.prompt_version, step.version);
        self.store
            .create_step_cache_key(&step.id, &Value::Object(inputs.clone()), &version, &flags)
    }

    /// Runs a step.
    ///
    /// Never returns an error: failures are reported in the result so the
    /// scheduler can decide between aborting and substituting a fallback.
    pub async fn run_step(
        &self,
        step: &StepDefinition,
        inputs: &StepInputs,
        skip_cache: bool,
        cancel: &CancellationToken,
    ) -> StepRunResult {
        let timer = SpanTimer::start(step.id.as_str());
        let cache_key = self.cache_key(step, inputs);

        if !skip_cache {
            if let Some(Value::Object(outputs)) = self.store.get(&cache_key).await {
                if declared_outputs_present(step, &outputs).is_ok() {
                    debug!(step = %step.id, key = %cache_key, "Cache hit");
                    let hash = content_hash(&Value::Object(outputs.clone()));
                    return StepRunResult {
                        success: true,
                        data: Some(outputs),
                        error: None,
                        duration_ms: timer.finish(),
                        cache_hit: true,
                        hash: Some(hash),
                        attempts: 0,
                        cache_key,
                    };
                }
                warn!(step = %step.id, key = %cache_key, "Cached entry lacks declared outputs; ignoring");
            }
        }

        let handler = self.handlers.get(&step.id);
        let work = match handler.prepare(step, inputs) {
            Ok(work) => work,
            Err(message) => {
                let error = StepError::new(&step.id, StepErrorKind::Handler, message);
                return StepRunResult::failed(error, timer.finish(), cache_key);
            }
        };

        let (outputs, attempts) = match work {
            StepWork::Computed(outputs) => (outputs, 1),
            StepWork::Generate(_) if self.config.dry_run => (self.dry_run_outputs(step), 1),
            StepWork::Generate(prompt) => {
                let Some(request) = self.request_for(step, prompt) else {
                    let error = StepError::new(&step.id, StepErrorKind::Handler, "external step has no model");
                    return StepRunResult::failed(error, timer.finish(), cache_key);
                };
                let RetryOutcome { result, attempts } = self.call(step, &request, cancel).await;
                match result.map_err(|e| StepError::from_generation(&step.id, &e, attempts)) {
                    Ok(text) => match handler.interpret(step, inputs, &text) {
                        Ok(outputs) => (outputs, attempts),
                        Err(message) => {
                            let error = StepError::new(&step.id, StepErrorKind::Handler, message)
                                .with_attempts(attempts);
                            return StepRunResult::failed(error, timer.finish(), cache_key);
                        }
                    },
                    Err(error) => {
                        warn!(step = %step.id, attempts, error = %error, "Step failed");
                        return StepRunResult::failed(error, timer.finish(), cache_key);
                    }
                }
            }
        };

        if let Err(message) = declared_outputs_present(step, &outputs) {
            let error = StepError::new(&step.id, StepErrorKind::Contract, message).with_attempts(attempts);
            return StepRunResult::failed(error, timer.finish(), cache_key);
        }

        let value = Value::Object(outputs.clone());
        let hash = content_hash(&value);
        self.store
            .set(
                &cache_key,
                value,
                CacheMetadata::new(EntryKind::StepResult).with_step(&step.id),
            )
            .await;

        let duration_ms = timer.finish();
        info!(step = %step.id, attempts, duration_ms, "Step produced new result");
        self.events
            .emit(
                names::STEP_RESULT,
                Some(json!({
                    "step": step.id,
                    "hash": hash,
                    "cache_key": cache_key,
                    "attempts": attempts,
                    "duration_ms": duration_ms,
                    "dry_run": self.config.dry_run,
                })),
            )
            .await;

        StepRunResult {
            success: true,
            data: Some(outputs),
            error: None,
            duration_ms,
            cache_hit: false,
            hash: Some(hash),
            attempts,
            cache_key,
        }
    }

    fn request_for(&self, step: &StepDefinition, prompt: PromptParts) -> Option<GenerationRequest> {
        let model = self.model_for(step)?;
        let mut request = GenerationRequest::new(model, prompt.user)
            .with_max_output_tokens(self.config.max_output_tokens)
            .with_temperature(self.config.temperature);
        if let Some(system) = prompt.system {
            request = request.with_system_prompt(system);
        }
        Some(request)
    }

    async fn call(
        &self,
        step: &StepDefinition,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> RetryOutcome<String, GenerationError> {
        let limit = self.config.token_limits.limit_for(&request.model);
        let estimated = request.estimated_tokens();
        let timeout = self.config.call_timeout();
        let gate = self.gate.as_ref();
        let client = self.client.as_ref();
        let step_id = step.id.as_str();

        with_retry(
            &self.config.retry,
            step_id,
            cancel,
            GenerationError::retry_policy,
            move || async move {
                let waited = gate.reserve(&request.model, estimated, limit, cancel).await?;
                if !waited.is_zero() {
                    debug!(
                        step = step_id,
                        model = %request.model,
                        waited_ms = waited.as_millis() as u64,
                        "Waited for token budget"
                    );
                }
                match tokio::time::timeout(timeout, client.generate(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(GenerationError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            },
        )
        .await
    }

    fn dry_run_outputs(&self, step: &StepDefinition) -> StepOutputs {
        step.outputs
            .iter()
            .map(|b| {
                (
                    b.name.clone(),
                    json!({
                        "dryRun": true,
                        "step": step.id,
                        "model": self.model_for(step),
                        "summary": format!("Dry-run placeholder for {}", step.name),
                    }),
                )
            })
            .collect()
    }

    /// Builds a labeled fallback payload for a tolerant step that failed.
    ///
    /// Prefers the step's last successful outputs, then the handler's
    /// assumptions.
    pub async fn fallback(&self, step: &StepDefinition, inputs: &StepInputs, reason: &str) -> StepOutputs {
        let last = self
            .store
            .load_step_output(&step.id)
            .await
            .and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .filter(|map| declared_outputs_present(step, map).is_ok());

        let (source, content) = match last {
            Some(map) => ("last_output", map),
            None => ("assumptions", self.handlers.get(&step.id).assumptions(step, inputs)),
        };

        let mut outputs = Map::new();
        for binding in &step.outputs {
            outputs.insert(
                binding.name.clone(),
                json!({
                    "fallback": true,
                    "source": source,
                    "reason": reason,
                    "content": content.get(&binding.name).cloned().unwrap_or(Value::Null),
                }),
            );
        }
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenLimitConfig;
    use crate::events::CollectingEventSink;
    use crate::executor::MockGenerativeClient;
    use crate::executor::RetryConfig;
    use crate::graph::dossier_graph;
    use crate::testing::ScriptedClient;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_retry(RetryConfig::new().with_base_delay_ms(100).with_max_delay_ms(400))
            .with_call_timeout(Duration::from_secs(25))
    }

    fn executor_with(client: Arc<dyn GenerativeClient>, config: EngineConfig) -> (StepExecutor, Arc<CollectingEventSink>) {
        let events = Arc::new(CollectingEventSink::new());
        let executor = StepExecutor::new(
            Arc::new(ContentStore::in_memory(100)),
            Arc::new(TokenBudgetGate::from_config(&TokenLimitConfig::default())),
            client,
            Arc::new(HandlerRegistry::dossier()),
            Arc::new(config),
            events.clone(),
        );
        (executor, events)
    }

    fn market_inputs() -> StepInputs {
        let mut inputs = Map::new();
        inputs.insert("brief".into(), json!({"summary": "rockets"}));
        inputs
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_timeouts_then_success() {
        let client = Arc::new(
            ScriptedClient::new()
                .then_delay(Duration::from_secs(30))
                .then_delay(Duration::from_secs(30))
                .then_ok(r#"{"tam": 1}"#),
        );
        let (executor, _) = executor_with(client.clone(), config());
        let graph = dossier_graph().unwrap();
        let step = graph.step("market").unwrap();

        let result = executor
            .run_step(step, &market_inputs(), false, &CancellationToken::new())
            .await;

        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.data.unwrap()["market"], json!({"tam": 1}));
        assert_eq!(client.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let mut mock = MockGenerativeClient::new();
        mock.expect_generate()
            .times(1)
            .returning(|_| Err(GenerationError::InvalidCredentials("bad key".into())));
        let (executor, _) = executor_with(Arc::new(mock), config());
        let graph = dossier_graph().unwrap();

        let result = executor
            .run_step(graph.step("market").unwrap(), &market_inputs(), false, &CancellationToken::new())
            .await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.kind, StepErrorKind::NonRetryable);
        assert_eq!(error.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let mut mock = MockGenerativeClient::new();
        mock.expect_generate()
            .times(3)
            .returning(|_| Err(GenerationError::RateLimited { retry_after_ms: Some(50) }));
        let (executor, _) = executor_with(Arc::new(mock), config());
        let graph = dossier_graph().unwrap();

        let result = executor
            .run_step(graph.step("market").unwrap(), &market_inputs(), false, &CancellationToken::new())
            .await;

        let error = result.error.unwrap();
        assert_eq!(error.kind, StepErrorKind::RetriesExhausted);
        assert_eq!(error.attempts, 3);
    }

    #[tokio::test]
    async fn test_second_run_hits_cache() {
        let client = Arc::new(ScriptedClient::new().with_default_response(r#"{"tam": 2}"#));
        let (executor, events) = executor_with(client.clone(), config());
        let graph = dossier_graph().unwrap();
        let step = graph.step("market").unwrap();
        let cancel = CancellationToken::new();

        let first = executor.run_step(step, &market_inputs(), false, &cancel).await;
        let second = executor.run_step(step, &market_inputs(), false, &cancel).await;

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.cache_key, second.cache_key);
        assert_eq!(first.hash, second.hash);
        assert_eq!(client.calls().len(), 1);
        assert_eq!(events.steps_for(names::STEP_RESULT), vec!["market"]);

        let bypass = executor.run_step(step, &market_inputs(), true, &cancel).await;
        assert!(!bypass.cache_hit);
        assert_eq!(client.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_skips_client_and_uses_own_key() {
        let mut mock = MockGenerativeClient::new();
        mock.expect_generate().never();
        let (dry, _) = executor_with(Arc::new(mock), config().with_dry_run(true));
        let (live, _) = executor_with(Arc::new(ScriptedClient::new()), config());
        let graph = dossier_graph().unwrap();
        let step = graph.step("market").unwrap();

        let result = dry
            .run_step(step, &market_inputs(), false, &CancellationToken::new())
            .await;

        assert!(result.success);
        assert_eq!(result.data.unwrap()["market"]["dryRun"], true);
        assert_ne!(dry.cache_key(step, &market_inputs()), live.cache_key(step, &market_inputs()));
    }

    #[tokio::test]
    async fn test_fallback_prefers_last_output() {
        let (executor, _) = executor_with(Arc::new(ScriptedClient::new()), config());
        let graph = dossier_graph().unwrap();
        let step = graph.step("team").unwrap();

        let assumed = executor.fallback(step, &Map::new(), "timeout").await;
        assert_eq!(assumed["team"]["source"], "assumptions");
        assert_eq!(assumed["team"]["fallback"], true);

        executor
            .store
            .save_step_output("team", &json!({"team": {"size": 4}}))
            .await;
        let reused = executor.fallback(step, &Map::new(), "timeout").await;
        assert_eq!(reused["team"]["source"], "last_output");
        assert_eq!(reused["team"]["content"], json!({"size": 4}));
        assert_eq!(reused["team"]["reason"], "timeout");
    }

    #[tokio::test]
    async fn test_computed_step_needs_no_client() {
        let mut mock = MockGenerativeClient::new();
        mock.expect_generate().never();
        let (executor, _) = executor_with(Arc::new(mock), config());
        let graph = dossier_graph().unwrap();
        let mut inputs = Map::new();
        inputs.insert("input".into(), json!({"title": "Acme", "pitchText": "Rockets"}));

        let result = executor
            .run_step(graph.step("pitch_intake").unwrap(), &inputs, false, &CancellationToken::new())
            .await;

        assert!(result.success);
        assert_eq!(result.attempts, 1);
    }
}
