//! Batch scheduler over the step graph.
//!
//! Each loop iteration skips whatever the rebuild plan allows, collects the
//! ready steps, runs up to `parallel_limit` of them concurrently and merges
//! their outputs. One failing step fails the run after the whole batch has
//! settled, leaving an error checkpoint for `resume`.

use super::options::{validate_run_id, Checkpoint, ExecuteOptions, PipelineErrorInfo, PipelineResult};
use super::{CancellationToken, DeadlineGuard};
use crate::cache::{content_hash, ContentStore};
use crate::config::EngineConfig;
use crate::core::{ArtifactStore, PipelineInput, PipelineState, StepStatus};
use crate::errors::{DossierError, StepError, StepErrorKind};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::executor::{GenerativeClient, HandlerRegistry, StepExecutor, StepInputs, StepOutputs, StepRunResult};
use crate::gate::TokenBudgetGate;
use crate::graph::{dossier_graph, StepDefinition, StepGraph, SEED_KEYS};
use crate::rebuild::{BuildRecord, BuildState, InputDigest, RebuildAnalyzer, RebuildPlan};
use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const TIMEOUT_REASON: &str = "pipeline timeout";

/// Collaborators shared by every run of a scheduler.
#[derive(Clone)]
pub struct EngineServices {
    /// Cache, checkpoint and build-state store.
    pub store: Arc<ContentStore>,
    /// Rate gate in front of the generative service.
    pub gate: Arc<TokenBudgetGate>,
    /// The generative service.
    pub client: Arc<dyn GenerativeClient>,
    /// Step handlers.
    pub handlers: Arc<HandlerRegistry>,
    /// Progress and artifact-log sink.
    pub events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServices")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl EngineServices {
    /// Creates services from a configuration: a file-backed store under
    /// `cache_dir`, a gate from the token limits, dossier handlers and no
    /// event sink.
    #[must_use]
    pub fn new(config: &EngineConfig, client: Arc<dyn GenerativeClient>) -> Self {
        Self {
            store: Arc::new(ContentStore::from_config(config)),
            gate: Arc::new(TokenBudgetGate::from_config(&config.token_limits)),
            client,
            handlers: Arc::new(HandlerRegistry::dossier()),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Replaces the store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<ContentStore>) -> Self {
        self.store = store;
        self
    }

    /// Replaces the gate.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<TokenBudgetGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Replaces the handlers.
    #[must_use]
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }
}

/// Mutable state of one run. Never shared between runs.
struct Run {
    run_id: String,
    input: PipelineInput,
    digest: InputDigest,
    previous_build: Option<BuildState>,
    plan: RebuildPlan,
    state: PipelineState,
    artifacts: ArtifactStore,
    cache_hits: usize,
    skip_cache: bool,
    parallel_limit: usize,
}

/// Executes the step graph for one input at a time per run id.
pub struct PipelineScheduler {
    graph: Arc<StepGraph>,
    config: Arc<EngineConfig>,
    analyzer: RebuildAnalyzer,
    executor: Arc<StepExecutor>,
    store: Arc<ContentStore>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for PipelineScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineScheduler")
            .field("steps", &self.graph.len())
            .field("parallel_limit", &self.config.parallel_limit)
            .finish_non_exhaustive()
    }
}

impl PipelineScheduler {
    /// Creates a scheduler for a graph.
    #[must_use]
    pub fn new(graph: Arc<StepGraph>, config: Arc<EngineConfig>, services: EngineServices) -> Self {
        let executor = StepExecutor::new(
            Arc::clone(&services.store),
            services.gate,
            services.client,
            services.handlers,
            Arc::clone(&config),
            Arc::clone(&services.events),
        );
        Self {
            analyzer: RebuildAnalyzer::new(Arc::clone(&graph)),
            graph,
            config,
            executor: Arc::new(executor),
            store: services.store,
            events: services.events,
        }
    }

    /// Creates a scheduler for the dossier graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or the compiled-in graph is
    /// invalid.
    pub fn dossier(config: EngineConfig, services: EngineServices) -> Result<Self, DossierError> {
        config.validate()?;
        Ok(Self::new(Arc::new(dossier_graph()?), Arc::new(config), services))
    }

    /// Returns the graph.
    #[must_use]
    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    /// Returns the store.
    #[must_use]
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// Runs the pipeline for an input.
    ///
    /// Run-time failures (step failure, deadlock, timeout) are reported in
    /// the result together with the per-step state.
    ///
    /// # Errors
    ///
    /// Returns an error only when the run cannot start because the input or
    /// the run id is invalid.
    pub async fn execute(
        &self,
        input: PipelineInput,
        options: ExecuteOptions,
    ) -> Result<PipelineResult, DossierError> {
        input.validate()?;
        let run_id = match &options.run_id {
            Some(id) => id.clone(),
            None => uuid::Uuid::now_v7().to_string(),
        };
        validate_run_id(&run_id)?;

        if options.resume_from_checkpoint {
            if let Some(checkpoint) = self.store.load_checkpoint(&run_id).await {
                info!(run_id = %run_id, "Resuming from checkpoint");
                return self.continue_from(checkpoint, Some(input), &options).await;
            }
            warn!(run_id = %run_id, "No checkpoint to resume; starting a fresh run");
        }

        let digest = InputDigest::from_input(&input, &self.config.prompt_version);
        let previous_build = self.store.load_build_state().await;
        let plan = self
            .analyzer
            .analyze(&digest, previous_build.as_ref(), options.skip_cache);

        let mut artifacts = ArtifactStore::new();
        artifacts.insert("input", input.pitch_component());
        if let Some(evidence) = &input.evidence {
            artifacts.insert("evidence", evidence.clone());
        }

        let run = Run {
            state: PipelineState::new(&run_id, self.graph.topological_order()),
            run_id,
            input,
            digest,
            previous_build,
            plan,
            artifacts,
            cache_hits: 0,
            skip_cache: options.skip_cache,
            parallel_limit: options.parallel_limit.unwrap_or(self.config.parallel_limit).max(1),
        };
        Ok(self.drive(run, &options, false).await)
    }

    /// Continues a run from its checkpoint.
    ///
    /// When `input` is given it must match the checkpointed input.
    ///
    /// # Errors
    ///
    /// Returns [`DossierError::NoCheckpoint`] when the run has no checkpoint,
    /// for example because it already completed.
    pub async fn resume(
        &self,
        run_id: &str,
        input: Option<PipelineInput>,
    ) -> Result<PipelineResult, DossierError> {
        validate_run_id(run_id)?;
        let checkpoint = self
            .store
            .load_checkpoint(run_id)
            .await
            .ok_or_else(|| DossierError::NoCheckpoint {
                run_id: run_id.to_string(),
            })?;
        self.continue_from(checkpoint, input, &ExecuteOptions::new())
            .await
    }

    async fn continue_from(
        &self,
        checkpoint: Checkpoint,
        input: Option<PipelineInput>,
        options: &ExecuteOptions,
    ) -> Result<PipelineResult, DossierError> {
        if let Some(input) = &input {
            if *input != checkpoint.input {
                return Err(DossierError::InvalidInput(format!(
                    "input differs from the one checkpointed for run '{}'",
                    checkpoint.run_id
                )));
            }
        }

        let mut state = checkpoint.state;
        state.reset_unfinished();
        let run = Run {
            digest: InputDigest::from_input(&checkpoint.input, &self.config.prompt_version),
            previous_build: self.store.load_build_state().await,
            run_id: checkpoint.run_id,
            input: checkpoint.input,
            plan: checkpoint.plan,
            state,
            artifacts: checkpoint.artifacts,
            cache_hits: checkpoint.cache_hits,
            skip_cache: checkpoint.skip_cache,
            parallel_limit: options.parallel_limit.unwrap_or(checkpoint.parallel_limit).max(1),
        };
        let (done, total) = run.state.progress();
        info!(run_id = %run.run_id, done, total, "Continuing run");
        Ok(self.drive(run, options, true).await)
    }

    async fn drive(&self, mut run: Run, options: &ExecuteOptions, resumed: bool) -> PipelineResult {
        let started = Instant::now();
        let cancel = options
            .cancellation
            .clone()
            .unwrap_or_else(CancellationToken::new);
        let _deadline = options
            .timeout
            .or_else(|| self.config.pipeline_timeout())
            .map_or_else(DeadlineGuard::disarmed, |t| cancel.cancel_after(t, TIMEOUT_REASON));

        info!(
            run_id = %run.run_id,
            rebuild = run.plan.to_rebuild.len(),
            skip = run.plan.to_skip.len(),
            parallel_limit = run.parallel_limit,
            resumed,
            "Pipeline started"
        );
        self.events
            .emit(
                names::PIPELINE_STARTED,
                Some(json!({
                    "run_id": run.run_id,
                    "resumed": resumed,
                    "reason": run.plan.reason,
                    "to_rebuild": run.plan.to_rebuild,
                    "to_skip": run.plan.to_skip,
                    "estimated_duration_ms": run.plan.estimated_duration_ms,
                })),
            )
            .await;

        let total = self.graph.len();
        let mut since_checkpoint = 0usize;

        loop {
            self.skip_reusable(&mut run).await;
            let done = run.state.done_steps();
            if done.len() == total {
                break;
            }
            if cancel.is_cancelled() {
                let error = cancellation_error(&cancel, started);
                return self.fail(run, error, started).await;
            }

            let ready: Vec<&StepDefinition> = self
                .graph
                .steps_in_order()
                .filter(|s| run.state.status(&s.id) == StepStatus::Pending)
                .filter(|s| run.plan.rebuilds(&s.id))
                .filter(|s| s.dependencies.iter().all(|d| done.contains(d)))
                .collect();

            if ready.is_empty() {
                let stuck: Vec<String> = self
                    .graph
                    .topological_order()
                    .iter()
                    .filter(|id| !done.contains(*id))
                    .cloned()
                    .collect();
                error!(run_id = %run.run_id, ?stuck, "Dependency deadlock");
                return self
                    .fail(run, DossierError::DependencyDeadlock { stuck }, started)
                    .await;
            }

            let batch: Vec<StepDefinition> = ready
                .into_iter()
                .take(run.parallel_limit)
                .cloned()
                .collect();

            if batch.iter().any(|s| s.critical) {
                self.checkpoint(&run, None).await;
                since_checkpoint = 0;
            }

            let (completed, failure) = self.run_batch(&mut run, batch, &cancel).await;
            if let Some(step_error) = failure {
                let error = if step_error.kind == StepErrorKind::Cancelled && cancel.is_cancelled() {
                    cancellation_error(&cancel, started)
                } else {
                    DossierError::StepFailed(step_error)
                };
                return self.fail(run, error, started).await;
            }

            since_checkpoint += completed;
            if self.config.checkpoint_every > 0 && since_checkpoint >= self.config.checkpoint_every {
                self.checkpoint(&run, None).await;
                since_checkpoint = 0;
            }
        }

        self.succeed(run, started).await
    }

    /// Marks every skippable step whose dependencies are done, reloading the
    /// cached result for its current inputs. Steps without one are promoted
    /// to run. Steps whose outputs the caller supplied are never run.
    async fn skip_reusable(&self, run: &mut Run) {
        for step in self.graph.steps_in_order() {
            if run.state.status(&step.id) != StepStatus::Pending {
                continue;
            }
            if !step
                .dependencies
                .iter()
                .all(|d| run.state.status(d).is_done())
            {
                continue;
            }

            if let Some(supplied) = seeded_outputs(step, &run.artifacts) {
                let hash = content_hash(&Value::Object(supplied));
                run.state.mark_skipped(&step.id, Some(hash));
                debug!(run_id = %run.run_id, step = %step.id, "Step outputs supplied by caller");
                self.events
                    .emit(
                        names::STEP_SKIPPED,
                        Some(json!({"run_id": run.run_id, "step": step.id, "reason": "supplied by caller"})),
                    )
                    .await;
                continue;
            }
            if run.plan.rebuilds(&step.id) {
                continue;
            }

            let reloaded = match gather_inputs(step, &run.artifacts) {
                Ok(inputs) => self
                    .store
                    .get(&self.executor.cache_key(step, &inputs))
                    .await
                    .and_then(|v| match v {
                        Value::Object(map) => Some(map),
                        _ => None,
                    })
                    .filter(|map| step.outputs.iter().all(|b| map.contains_key(&b.name))),
                Err(_) => None,
            };

            let Some(outputs) = reloaded else {
                warn!(
                    run_id = %run.run_id,
                    step = %step.id,
                    "No reusable output for skipped step; running it instead"
                );
                run.plan.promote(&step.id);
                continue;
            };

            merge_outputs(&mut run.artifacts, step, &outputs);
            let hash = content_hash(&Value::Object(outputs));
            run.state.mark_skipped(&step.id, Some(hash));
            run.cache_hits += 1;
            debug!(run_id = %run.run_id, step = %step.id, "Step skipped");
            self.events
                .emit(
                    names::STEP_SKIPPED,
                    Some(json!({"run_id": run.run_id, "step": step.id, "reason": run.plan.reason})),
                )
                .await;
        }
    }

    /// Runs one batch to completion. Returns the number of steps completed
    /// and the first failure of a non-tolerant step.
    async fn run_batch(
        &self,
        run: &mut Run,
        batch: Vec<StepDefinition>,
        cancel: &Arc<CancellationToken>,
    ) -> (usize, Option<StepError>) {
        let mut launched = Vec::with_capacity(batch.len());
        let mut failure = None;

        for step in batch {
            let inputs = match gather_inputs(&step, &run.artifacts) {
                Ok(inputs) => inputs,
                Err(missing) => {
                    let error = StepError::new(
                        &step.id,
                        StepErrorKind::Contract,
                        format!("missing input '{missing}'"),
                    );
                    run.state.mark_failed(&step.id, 0, error.to_string(), 0);
                    failure.get_or_insert(error);
                    continue;
                }
            };
            run.state.mark_running(&step.id);
            info!(run_id = %run.run_id, step = %step.id, "Step started");
            self.events
                .emit(
                    names::STEP_STARTED,
                    Some(json!({"run_id": run.run_id, "step": step.id})),
                )
                .await;
            launched.push((step, inputs));
        }

        let skip_cache = run.skip_cache;
        let handles = launched.iter().map(|(step, inputs)| {
            let executor = Arc::clone(&self.executor);
            let cancel = Arc::clone(cancel);
            let step = step.clone();
            let inputs = inputs.clone();
            tokio::spawn(async move { executor.run_step(&step, &inputs, skip_cache, &cancel).await })
        });
        let results = join_all(handles).await;

        let mut completed = 0;
        for ((step, inputs), joined) in launched.into_iter().zip(results) {
            let result = joined.unwrap_or_else(|e| StepRunResult {
                success: false,
                data: None,
                error: Some(StepError::new(
                    &step.id,
                    StepErrorKind::Handler,
                    format!("step task aborted: {e}"),
                )),
                duration_ms: 0,
                cache_hit: false,
                hash: None,
                attempts: 0,
                cache_key: String::new(),
            });

            match (result.data, result.error) {
                (Some(outputs), _) if result.success => {
                    merge_outputs(&mut run.artifacts, &step, &outputs);
                    run.state.mark_completed(
                        &step.id,
                        result.duration_ms,
                        result.hash,
                        result.cache_hit,
                        result.attempts,
                    );
                    if result.cache_hit {
                        run.cache_hits += 1;
                    }
                    completed += 1;
                    info!(
                        run_id = %run.run_id,
                        step = %step.id,
                        duration_ms = result.duration_ms,
                        cache_hit = result.cache_hit,
                        "Step completed"
                    );
                    self.events
                        .emit(
                            names::STEP_COMPLETED,
                            Some(json!({
                                "run_id": run.run_id,
                                "step": step.id,
                                "duration_ms": result.duration_ms,
                                "cache_hit": result.cache_hit,
                                "attempts": result.attempts,
                            })),
                        )
                        .await;
                }
                (_, error) => {
                    let error = error.unwrap_or_else(|| {
                        StepError::new(&step.id, StepErrorKind::Contract, "step produced no outputs")
                    });
                    if step.tolerant && error.kind != StepErrorKind::Cancelled {
                        let reason = error.to_string();
                        let outputs = self.executor.fallback(&step, &inputs, &reason).await;
                        merge_outputs(&mut run.artifacts, &step, &outputs);
                        let hash = content_hash(&Value::Object(outputs));
                        run.state.mark_fallback(&step.id, result.duration_ms, hash, reason.clone(), error.attempts);
                        completed += 1;
                        warn!(run_id = %run.run_id, step = %step.id, error = %reason, "Step degraded to fallback");
                        self.events
                            .emit(
                                names::STEP_FALLBACK,
                                Some(json!({"run_id": run.run_id, "step": step.id, "error": reason})),
                            )
                            .await;
                    } else {
                        run.state.mark_failed(&step.id, result.duration_ms, error.to_string(), error.attempts);
                        error!(run_id = %run.run_id, step = %step.id, error = %error, "Step failed");
                        self.events
                            .emit(
                                names::STEP_FAILED,
                                Some(json!({
                                    "run_id": run.run_id,
                                    "step": step.id,
                                    "error": error.to_string(),
                                    "attempts": error.attempts,
                                })),
                            )
                            .await;
                        failure.get_or_insert(error);
                    }
                }
            }
        }

        (completed, failure)
    }

    async fn checkpoint(&self, run: &Run, error: Option<&DossierError>) -> bool {
        let checkpoint = Checkpoint {
            run_id: run.run_id.clone(),
            state: run.state.clone(),
            artifacts: run.artifacts.clone(),
            cache_hits: run.cache_hits,
            plan: run.plan.clone(),
            input: run.input.clone(),
            error: error.map(ToString::to_string),
            saved_at: Utc::now(),
            skip_cache: run.skip_cache,
            parallel_limit: run.parallel_limit,
        };
        let saved = self.store.save_checkpoint(&checkpoint).await;
        if saved {
            let (done, total) = run.state.progress();
            self.events
                .emit(
                    names::CHECKPOINT_SAVED,
                    Some(json!({
                        "run_id": run.run_id,
                        "done": done,
                        "total": total,
                        "error": checkpoint.error,
                    })),
                )
                .await;
        } else {
            warn!(run_id = %run.run_id, "Checkpoint could not be saved");
        }
        saved
    }

    async fn fail(&self, run: Run, error: DossierError, started: Instant) -> PipelineResult {
        let saved = self.checkpoint(&run, Some(&error)).await;
        let resumable = saved && !matches!(error, DossierError::DependencyDeadlock { .. });
        let duration_ms = elapsed_ms(started);
        error!(run_id = %run.run_id, error = %error, resumable, duration_ms, "Pipeline failed");

        let info = PipelineErrorInfo::from_error(&error, resumable);
        self.events
            .emit(
                names::PIPELINE_FAILED,
                Some(json!({
                    "run_id": run.run_id,
                    "kind": info.kind,
                    "error": info.message,
                    "step": info.step,
                    "resumable": resumable,
                })),
            )
            .await;

        PipelineResult {
            run_id: run.run_id,
            success: false,
            data: None,
            error: Some(info),
            state: run.state,
            plan: run.plan,
            cache_hits: run.cache_hits,
            duration_ms,
        }
    }

    async fn succeed(&self, run: Run, started: Instant) -> PipelineResult {
        let data = self.final_artifact(&run.artifacts);
        self.store.save_artifact(&run.run_id, &data).await;
        self.store.delete_checkpoint(&run.run_id).await;
        self.save_last_outputs(&run).await;

        let affected_steps = self
            .graph
            .topological_order()
            .iter()
            .filter(|id| run.plan.rebuilds(id))
            .cloned()
            .collect();
        let record = BuildRecord {
            timestamp: Utc::now(),
            changed: run.plan.changed.clone(),
            affected_steps,
            reason: run.plan.reason.clone(),
        };
        let build = BuildState::record(run.previous_build.as_ref(), &run.digest, &run.artifacts, record);
        self.store.save_build_state(&build).await;

        let duration_ms = elapsed_ms(started);
        info!(
            run_id = %run.run_id,
            duration_ms,
            cache_hits = run.cache_hits,
            "Pipeline completed"
        );
        self.events
            .emit(
                names::PIPELINE_COMPLETED,
                Some(json!({
                    "run_id": run.run_id,
                    "duration_ms": duration_ms,
                    "cache_hits": run.cache_hits,
                })),
            )
            .await;

        PipelineResult {
            run_id: run.run_id,
            success: true,
            data: Some(data),
            error: None,
            state: run.state,
            plan: run.plan,
            cache_hits: run.cache_hits,
            duration_ms,
        }
    }

    /// Records each step's outputs from a completed run as the source for
    /// later fallbacks. Fallback payloads are not recorded.
    async fn save_last_outputs(&self, run: &Run) {
        for step in self.graph.steps_in_order() {
            if run.state.get(&step.id).map_or(true, |s| s.fallback) {
                continue;
            }
            let outputs: Map<String, Value> = step
                .outputs
                .iter()
                .filter_map(|b| Some((b.name.clone(), run.artifacts.get(&b.path)?.clone())))
                .collect();
            if outputs.len() == step.outputs.len() {
                self.store
                    .save_step_output(&step.id, &Value::Object(outputs))
                    .await;
            }
        }
    }

    /// The outputs of the graph's final step: the single output value, or
    /// a map of outputs when it declares several.
    fn final_artifact(&self, artifacts: &ArtifactStore) -> Value {
        let Some(last) = self
            .graph
            .topological_order()
            .last()
            .and_then(|id| self.graph.step(id))
        else {
            return artifacts.to_value();
        };
        match last.outputs.as_slice() {
            [single] => artifacts.get(&single.path).cloned().unwrap_or(Value::Null),
            many => Value::Object(
                many.iter()
                    .map(|b| (b.name.clone(), artifacts.get(&b.path).cloned().unwrap_or(Value::Null)))
                    .collect(),
            ),
        }
    }
}

fn gather_inputs(step: &StepDefinition, artifacts: &ArtifactStore) -> Result<StepInputs, String> {
    let mut inputs = Map::new();
    for binding in &step.inputs {
        let value = artifacts.get(&binding.path).ok_or_else(|| binding.path.clone())?;
        inputs.insert(binding.name.clone(), value.clone());
    }
    Ok(inputs)
}

/// The step's outputs when every one of them is a caller-seeded artifact.
fn seeded_outputs(step: &StepDefinition, artifacts: &ArtifactStore) -> Option<StepOutputs> {
    if step.outputs.is_empty() {
        return None;
    }
    step.outputs
        .iter()
        .map(|b| {
            if SEED_KEYS.contains(&b.path.as_str()) {
                Some((b.name.clone(), artifacts.get(&b.path)?.clone()))
            } else {
                None
            }
        })
        .collect()
}

/// Writes a step's outputs to their artifact paths. Caller-seeded artifacts
/// are kept.
fn merge_outputs(artifacts: &mut ArtifactStore, step: &StepDefinition, outputs: &StepOutputs) {
    let seeded: HashSet<&str> = SEED_KEYS.iter().copied().collect();
    for binding in &step.outputs {
        let Some(value) = outputs.get(&binding.name) else {
            continue;
        };
        if seeded.contains(binding.path.as_str()) {
            artifacts.insert_if_absent(&binding.path, value.clone());
        } else {
            artifacts.insert(&binding.path, value.clone());
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn cancellation_error(cancel: &CancellationToken, started: Instant) -> DossierError {
    match cancel.reason() {
        Some(reason) if reason != TIMEOUT_REASON => DossierError::Cancelled(reason),
        _ => DossierError::Timeout {
            elapsed_ms: elapsed_ms(started),
        },
    }
}
