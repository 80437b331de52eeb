//! End-to-end scheduler tests over the dossier graph.

use chrono::Utc;
use dossierflow::cache::ContentStore;
use dossierflow::core::{ArtifactStore, PipelineState, StepStatus};
use dossierflow::errors::{ErrorKind, GenerationError};
use dossierflow::events::names;
use dossierflow::graph::{ModelTier, StepDefinition, StepGraph};
use dossierflow::pipeline::{Checkpoint, ExecuteOptions};
use dossierflow::rebuild::RebuildPlan;
use dossierflow::testing::{sample_input, test_config, Reply, ScriptedClient, TestEngine};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

fn ids(steps: &[&str]) -> BTreeSet<String> {
    steps.iter().map(|s| (*s).to_string()).collect()
}

fn started_since(engine: &TestEngine, from: usize) -> Vec<String> {
    engine.events.events()[from..]
        .iter()
        .filter(|(t, _)| t == names::STEP_STARTED)
        .filter_map(|(_, d)| d.as_ref()?.get("step")?.as_str().map(str::to_string))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn first_build_runs_every_step() {
    let engine = TestEngine::dossier(ScriptedClient::new());

    let result = engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new().with_run_id("first"))
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.plan.to_rebuild.len(), 15);
    assert!(result.plan.to_skip.is_empty());
    assert_eq!(engine.events.steps_for(names::STEP_STARTED).len(), 15);
    // pitch_intake and assemble are computed locally
    assert_eq!(engine.client.calls().len(), 13);

    let dossier = result.data.unwrap();
    assert_eq!(dossier["title"], "Orbital Freight");
    assert_eq!(dossier["sections"].as_object().unwrap().len(), 8);
    assert!(engine.store.load_build_state().await.is_some());
    assert!(engine.store.load_artifact("first").await.is_some());
    assert!(engine.store.load_checkpoint("first").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn steps_never_start_before_their_dependencies() {
    let engine = TestEngine::dossier(ScriptedClient::new().with_latency(Duration::from_millis(20)));
    let result = engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new().with_parallel_limit(3))
        .await
        .unwrap();
    assert!(result.success);

    let mut finished: HashSet<String> = HashSet::new();
    for (event, data) in engine.events.events() {
        let Some(step) = data.as_ref().and_then(|d| d.get("step")).and_then(|s| s.as_str()) else {
            continue;
        };
        if event == names::STEP_STARTED {
            let definition = engine.scheduler.graph().step(step).unwrap();
            for dep in &definition.dependencies {
                assert!(finished.contains(dep), "{step} started before {dep}");
            }
        } else if event == names::STEP_COMPLETED || event == names::STEP_SKIPPED {
            finished.insert(step.to_string());
        }
    }
    assert_eq!(finished.len(), 15);
}

#[tokio::test(start_paused = true)]
async fn batches_respect_parallel_limit() {
    let engine = TestEngine::dossier(ScriptedClient::new().with_latency(Duration::from_millis(50)));
    engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new())
        .await
        .unwrap();
    assert_eq!(engine.client.max_in_flight(), 2);

    let serial = TestEngine::dossier(ScriptedClient::new().with_latency(Duration::from_millis(50)));
    serial
        .scheduler
        .execute(sample_input(), ExecuteOptions::new().with_parallel_limit(1))
        .await
        .unwrap();
    assert_eq!(serial.client.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn unchanged_rebuild_skips_everything() {
    let engine = TestEngine::dossier(ScriptedClient::new());
    let first = engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new())
        .await
        .unwrap();
    let calls = engine.client.calls().len();

    let second = engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new())
        .await
        .unwrap();

    assert!(second.success);
    assert!(second.plan.to_rebuild.is_empty());
    assert_eq!(second.cache_hits, 15);
    assert_eq!(engine.client.calls().len(), calls);
    assert_eq!(second.data, first.data);
    assert!(second
        .state
        .steps
        .values()
        .all(|s| s.status == StepStatus::Skipped));
}

#[tokio::test(start_paused = true)]
async fn evidence_change_rebuilds_only_its_closure() {
    let engine = TestEngine::dossier(ScriptedClient::new());
    engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new())
        .await
        .unwrap();
    let before = engine.events.len();

    let input = sample_input().with_evidence(json!({"sources": ["supplied-report"]}));
    let result = engine
        .scheduler
        .execute(input, ExecuteOptions::new())
        .await
        .unwrap();

    let expected = ids(&[
        "brief",
        "market",
        "business_model",
        "gtm",
        "financial_plan",
        "validate",
        "investor_score",
        "assemble",
    ]);
    assert!(result.success);
    assert_eq!(result.plan.to_rebuild, expected);
    assert_eq!(started_since(&engine, before).into_iter().collect::<BTreeSet<_>>(), expected);
    assert!(result.plan.reason.contains("evidence"));

    let brief_prompts: Vec<_> = engine
        .client
        .calls()
        .into_iter()
        .filter(|r| r.user_prompt.contains("Task: Brief extraction"))
        .collect();
    assert_eq!(brief_prompts.len(), 2);
    assert!(brief_prompts[1].user_prompt.contains("supplied-report"));
}

#[tokio::test(start_paused = true)]
async fn pitch_change_rebuilds_everything() {
    let engine = TestEngine::dossier(ScriptedClient::new());
    engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new())
        .await
        .unwrap();

    let mut changed = sample_input();
    changed.pitch_text.push_str(" Now with a second launch site.");
    let result = engine
        .scheduler
        .execute(changed, ExecuteOptions::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.plan.to_rebuild.len(), 15);
}

#[tokio::test(start_paused = true)]
async fn resume_after_completion_has_no_checkpoint() {
    let engine = TestEngine::dossier(ScriptedClient::new());
    let result = engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new().with_run_id("done-run"))
        .await
        .unwrap();
    assert!(result.success);

    let err = engine.scheduler.resume("done-run", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoCheckpoint);
}

#[tokio::test(start_paused = true)]
async fn failed_run_checkpoints_and_resumes() {
    let client = ScriptedClient::new().on_prompt_times(
        "Task: Market analysis",
        Reply::Fail(GenerationError::InvalidCredentials("revoked".into())),
        1,
    );
    let engine = TestEngine::dossier(client);

    let failed = engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new().with_run_id("flaky"))
        .await
        .unwrap();

    assert!(!failed.success);
    let error = failed.error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::StepFailure);
    assert_eq!(error.step.as_deref(), Some("market"));
    assert!(failed.resumable());
    assert_eq!(failed.state.status("market"), StepStatus::Failed);
    assert_eq!(failed.state.status("brief"), StepStatus::Completed);

    let checkpoint = engine.store.load_checkpoint("flaky").await.unwrap();
    assert!(checkpoint.error.unwrap().contains("revoked"));

    let resumed = engine.scheduler.resume("flaky", None).await.unwrap();

    assert!(resumed.success, "{:?}", resumed.error);
    assert_eq!(engine.client.calls_matching("Task: Market analysis"), 2);
    assert_eq!(engine.client.calls_matching("Task: Project classification"), 1);
    assert_eq!(engine.client.calls_matching("Task: Brief extraction"), 1);
    assert!(engine.store.load_checkpoint("flaky").await.is_none());
    assert_eq!(
        engine.scheduler.resume("flaky", None).await.unwrap_err().kind(),
        ErrorKind::NoCheckpoint
    );
}

#[tokio::test(start_paused = true)]
async fn resume_rejects_different_input() {
    let client = ScriptedClient::new().on_prompt(
        "Task: Market analysis",
        Reply::Fail(GenerationError::PolicyViolation("blocked".into())),
    );
    let engine = TestEngine::dossier(client);
    engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new().with_run_id("strict"))
        .await
        .unwrap();

    let mut other = sample_input();
    other.title = "Another company".into();
    let err = engine.scheduler.resume("strict", Some(other)).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test(start_paused = true)]
async fn tolerant_step_degrades_to_fallback() {
    let client = ScriptedClient::new().on_prompt(
        "Task: Team section",
        Reply::Fail(GenerationError::Server("upstream down".into())),
    );
    let engine = TestEngine::dossier(client);

    let result = engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new())
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    let team = result.state.get("team").unwrap();
    assert!(team.fallback);
    assert_eq!(team.attempts, 3);
    assert_eq!(engine.client.calls_matching("Task: Team section"), 3);

    let section = &result.data.unwrap()["sections"]["team"];
    assert_eq!(section["fallback"], true);
    assert_eq!(section["source"], "assumptions");
    assert_eq!(engine.events.steps_for(names::STEP_FALLBACK), vec!["team"]);
}

#[tokio::test(start_paused = true)]
async fn timeout_leaves_checkpoint_for_resume() {
    let engine = TestEngine::dossier(ScriptedClient::new().with_latency(Duration::from_secs(5)));

    let result = engine
        .scheduler
        .execute(
            sample_input(),
            ExecuteOptions::new()
                .with_run_id("slow")
                .with_timeout(Duration::from_secs(7)),
        )
        .await
        .unwrap();

    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert!(error.resumable);
    let (done, total) = result.state.progress();
    assert!(done > 0 && done < total);
    assert!(engine.store.load_checkpoint("slow").await.is_some());

    let resumed = engine.scheduler.resume("slow", None).await.unwrap();
    assert!(resumed.success, "{:?}", resumed.error);
}

#[tokio::test(start_paused = true)]
async fn resume_flag_without_checkpoint_starts_fresh() {
    let engine = TestEngine::dossier(ScriptedClient::new());

    let result = engine
        .scheduler
        .execute(
            sample_input(),
            ExecuteOptions::new().with_run_id("fresh").resume_from_checkpoint(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.plan.to_rebuild.len(), 15);
}

#[tokio::test(start_paused = true)]
async fn dry_run_never_calls_the_service() {
    let engine = TestEngine::dossier_with(
        ScriptedClient::new(),
        test_config().with_dry_run(true),
        Arc::new(ContentStore::in_memory(500)),
    );

    let result = engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new())
        .await
        .unwrap();

    assert!(result.success);
    assert!(engine.client.calls().is_empty());
    assert_eq!(result.data.unwrap()["sections"]["market"]["dryRun"], true);
}

#[tokio::test]
async fn invalid_run_id_is_rejected() {
    let engine = TestEngine::dossier(ScriptedClient::new());

    let err = engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new().with_run_id("../escape"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidRunId);
    assert!(engine.events.is_empty());
}

#[tokio::test]
async fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first = TestEngine::dossier_with(
        ScriptedClient::new(),
        test_config(),
        Arc::new(ContentStore::file(dir.path(), 500)),
    );
    assert!(first
        .scheduler
        .execute(sample_input(), ExecuteOptions::new())
        .await
        .unwrap()
        .success);

    let restarted = TestEngine::dossier_with(
        ScriptedClient::new(),
        test_config(),
        Arc::new(ContentStore::file(dir.path(), 500)),
    );
    let result = restarted
        .scheduler
        .execute(sample_input(), ExecuteOptions::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.cache_hits, 15);
    assert!(restarted.client.calls().is_empty());
}

#[tokio::test]
async fn foreign_plan_is_reported_as_deadlock() {
    let graph = StepGraph::new(vec![
        StepDefinition::new("a", "Step A")
            .reads("input")
            .writes("x")
            .external(ModelTier::Fast),
        StepDefinition::new("b", "Step B")
            .with_dependencies(["a"])
            .reads("x")
            .writes("y")
            .external(ModelTier::Fast),
    ])
    .unwrap();
    let store = Arc::new(ContentStore::in_memory(50));
    let engine = TestEngine::with_graph(graph, ScriptedClient::new(), test_config(), store.clone());

    let mut artifacts = ArtifactStore::new();
    artifacts.insert("input", serde_json::to_value(sample_input()).unwrap());
    let checkpoint = Checkpoint {
        run_id: "stuck".into(),
        state: PipelineState::new("stuck", ["a", "b"]),
        artifacts,
        cache_hits: 0,
        plan: RebuildPlan {
            to_rebuild: ids(&["a"]),
            to_skip: BTreeSet::new(),
            reason: "hand-written".into(),
            estimated_duration_ms: 0,
            changed: Vec::new(),
        },
        input: sample_input(),
        error: None,
        saved_at: Utc::now(),
        skip_cache: false,
        parallel_limit: 2,
    };
    assert!(store.save_checkpoint(&checkpoint).await);

    let result = engine.scheduler.resume("stuck", None).await.unwrap();

    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::DependencyDeadlock);
    assert!(error.message.contains('b'));
    assert!(!error.resumable);
    assert_eq!(result.state.status("a"), StepStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn skipped_steps_reload_results_for_their_own_inputs() {
    let client = ScriptedClient::new().on_prompt(
        "ZEBRA-PITCH",
        Reply::Fail(GenerationError::InvalidCredentials("revoked".into())),
    );
    let engine = TestEngine::dossier(client);

    let first = engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new())
        .await
        .unwrap();
    assert!(first.success);

    let mut zebra = sample_input();
    zebra.pitch_text = "ZEBRA-PITCH striped logistics for the savanna".into();
    let failed = engine
        .scheduler
        .execute(zebra, ExecuteOptions::new())
        .await
        .unwrap();
    assert!(!failed.success);
    assert_eq!(failed.state.status("pitch_intake"), StepStatus::Completed);
    let calls_before = engine.client.calls().len();

    let input = sample_input().with_evidence(json!({"sources": ["fresh-report"]}));
    let result = engine
        .scheduler
        .execute(input, ExecuteOptions::new())
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    let intake = result.state.get("pitch_intake").unwrap();
    assert_eq!(intake.status, StepStatus::Skipped);
    assert_eq!(intake.hash, first.state.get("pitch_intake").unwrap().hash);
    assert!(engine.client.calls()[calls_before..]
        .iter()
        .all(|r| !r.user_prompt.contains("ZEBRA")));

    let saved = engine.store.load_step_output("pitch_intake").await.unwrap();
    assert!(!saved.to_string().contains("ZEBRA"));
    assert_eq!(result.data.unwrap()["title"], "Orbital Freight");
}

#[tokio::test(start_paused = true)]
async fn supplied_evidence_is_never_harvested() {
    let engine = TestEngine::dossier(ScriptedClient::new());
    let input = sample_input().with_evidence(json!({"sources": ["supplied-report"]}));

    let result = engine
        .scheduler
        .execute(input, ExecuteOptions::new())
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.state.status("harvest_evidence"), StepStatus::Skipped);
    assert_eq!(engine.client.calls_matching("Task: Evidence harvesting"), 0);
    assert!(engine
        .events
        .steps_for(names::STEP_SKIPPED)
        .contains(&"harvest_evidence".to_string()));
}

#[tokio::test(start_paused = true)]
async fn critical_steps_start_after_a_checkpoint() {
    let engine = TestEngine::dossier(ScriptedClient::new());
    let result = engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new())
        .await
        .unwrap();
    assert!(result.success);

    let critical: HashSet<&str> = ["harvest_evidence", "brief", "market", "business_model", "investor_score"]
        .into_iter()
        .collect();
    let events = engine.events.events();
    let mut checked = Vec::new();

    for (i, (event, data)) in events.iter().enumerate() {
        let Some(step) = data.as_ref().and_then(|d| d.get("step")).and_then(|s| s.as_str()) else {
            continue;
        };
        if event != names::STEP_STARTED || !critical.contains(step) {
            continue;
        }
        let preceding = events[..i]
            .iter()
            .rev()
            .map(|(t, _)| t.as_str())
            .find(|t| [names::CHECKPOINT_SAVED, names::STEP_COMPLETED, names::STEP_SKIPPED].contains(&t));
        assert_eq!(preceding, Some(names::CHECKPOINT_SAVED), "{step} started without a checkpoint");
        checked.push(step.to_string());
    }

    checked.sort();
    assert_eq!(checked, vec!["brief", "business_model", "harvest_evidence", "investor_score", "market"]);
}

#[tokio::test(start_paused = true)]
async fn periodic_checkpoints_follow_completion_cadence() {
    let engine = TestEngine::dossier_with(
        ScriptedClient::new(),
        test_config().with_checkpoint_every(2),
        Arc::new(ContentStore::in_memory(500)),
    );
    let result = engine
        .scheduler
        .execute(sample_input(), ExecuteOptions::new().with_parallel_limit(1))
        .await
        .unwrap();
    assert!(result.success);

    let graph = engine.scheduler.graph();
    let is_critical_start = |(event, data): &(String, Option<serde_json::Value>)| {
        event == names::STEP_STARTED
            && data
                .as_ref()
                .and_then(|d| d.get("step"))
                .and_then(|s| s.as_str())
                .and_then(|s| graph.step(s))
                .is_some_and(|s| s.critical)
    };

    let events = engine.events.events();
    let mut completions = 0usize;
    let mut periodic = 0usize;
    for (i, entry) in events.iter().enumerate() {
        if entry.0 == names::STEP_COMPLETED {
            completions += 1;
            assert!(completions <= 2, "more than two steps completed between checkpoints");
        } else if entry.0 == names::CHECKPOINT_SAVED {
            let next = events[i + 1..]
                .iter()
                .find(|(t, _)| t == names::STEP_STARTED || t == names::CHECKPOINT_SAVED);
            if !next.is_some_and(is_critical_start) {
                assert_eq!(completions, 2);
                periodic += 1;
            }
            completions = 0;
        }
    }

    assert!(completions < 2);
    assert!(periodic > 0);
}
