//! Test fixtures for pipeline runs.

use super::mocks::ScriptedClient;
use crate::cache::ContentStore;
use crate::config::EngineConfig;
use crate::core::PipelineInput;
use crate::events::CollectingEventSink;
use crate::executor::{HandlerRegistry, RetryConfig};
use crate::gate::TokenBudgetGate;
use crate::graph::{dossier_graph, StepGraph};
use crate::pipeline::{EngineServices, PipelineScheduler};
use std::sync::Arc;
use std::time::Duration;

/// A sample pitch.
#[must_use]
pub fn sample_input() -> PipelineInput {
    PipelineInput::new(
        "Orbital Freight",
        "Reusable cargo capsules for low earth orbit, built by a team of four \
         former launch engineers.",
    )
    .with_language("en")
    .with_geo("EU")
}

/// Engine configuration with short retry delays, a token budget no test
/// run exhausts and no pipeline timeout.
#[must_use]
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default()
        .with_retry(RetryConfig::new().with_base_delay_ms(10).with_max_delay_ms(40))
        .with_call_timeout(Duration::from_secs(25))
        .with_pipeline_timeout(None);
    config.token_limits.default_limit = 1_000_000;
    config.max_output_tokens = 512;
    config
}

/// A scheduler wired to in-memory collaborators.
pub struct TestEngine {
    /// The scheduler under test.
    pub scheduler: PipelineScheduler,
    /// The scripted generative client.
    pub client: Arc<ScriptedClient>,
    /// The shared store.
    pub store: Arc<ContentStore>,
    /// Every emitted event.
    pub events: Arc<CollectingEventSink>,
}

impl std::fmt::Debug for TestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEngine")
            .field("scheduler", &self.scheduler)
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl TestEngine {
    /// Builds the dossier engine around a client.
    ///
    /// # Panics
    ///
    /// Panics if the dossier graph is invalid.
    #[must_use]
    pub fn dossier(client: ScriptedClient) -> Self {
        Self::dossier_with(client, test_config(), Arc::new(ContentStore::in_memory(500)))
    }

    /// Builds the dossier engine with a given configuration and store.
    ///
    /// Reusing a store across engines simulates a process restart.
    ///
    /// # Panics
    ///
    /// Panics if the dossier graph is invalid.
    #[must_use]
    pub fn dossier_with(client: ScriptedClient, config: EngineConfig, store: Arc<ContentStore>) -> Self {
        let graph = match dossier_graph() {
            Ok(graph) => graph,
            Err(e) => panic!("dossier graph is invalid: {e}"),
        };
        Self::with_graph(graph, client, config, store)
    }

    /// Builds an engine for an arbitrary graph.
    #[must_use]
    pub fn with_graph(
        graph: StepGraph,
        client: ScriptedClient,
        config: EngineConfig,
        store: Arc<ContentStore>,
    ) -> Self {
        let client = Arc::new(client);
        let events = Arc::new(CollectingEventSink::new());
        let services = EngineServices {
            store: Arc::clone(&store),
            gate: Arc::new(TokenBudgetGate::from_config(&config.token_limits)),
            client: client.clone(),
            handlers: Arc::new(HandlerRegistry::dossier()),
            events: events.clone(),
        };
        Self {
            scheduler: PipelineScheduler::new(Arc::new(graph), Arc::new(config), services),
            client,
            store,
            events,
        }
    }
}
