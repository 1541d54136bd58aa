//! Safety Limits Integration Tests
//!
//! Step budgets of the outer graph and the research sub-graph, and how an
//! exhausted budget is finalized into the thread's state.

mod common;

use serde_json::json;

use common::{
    fast_limits, handoff, harness_with, harness_with_config, plan, research_reply, step,
    ScriptedGeneration, ScriptedRenderer,
};
use conductor::core::{CheckpointKey, CheckpointStore, EngineConfig, ResearchSettings, Route, RunInput, SafetyLimits};
use conductor::domain::{ResearchState, RunStatus};

fn three_writer_steps() -> std::sync::Arc<ScriptedGeneration> {
    ScriptedGeneration::new(|request| match request.node.as_str() {
        "coordinator" => Ok(handoff("Long deck", "slide")),
        "planner" => Ok(plan(vec![
            step("writer", "Part one", &[]),
            step("writer", "Part two", &[1]),
            step("writer", "Part three", &[2]),
        ])),
        "writer" => Ok(json!({"execution_summary": format!("Wrote {}", request.instruction)})),
        other => panic!("unexpected node {}", other),
    })
}

#[tokio::test]
async fn test_graph_budget_aborts_and_settles_state() {
    let limits = SafetyLimits {
        max_graph_steps: 4,
        ..fast_limits()
    };
    let h = harness_with(three_writer_steps(), ScriptedRenderer::png(), limits);
    let key = CheckpointKey::new("u_test", "thread-budget");

    let outcome = h
        .engine
        .invoke(&key, RunInput::new("A very long deck"))
        .await
        .unwrap();

    // coordinator, planner, supervisor, writer; the next supervisor visit is refused
    assert_eq!(outcome.steps_taken, 4);
    match &outcome.status {
        RunStatus::Aborted { reason } => assert!(reason.contains("step budget of 4")),
        other => panic!("expected abort, got {:?}", other),
    }

    let state = &outcome.state;
    assert!(state.in_progress_step().is_none());

    // The step that ran keeps its own summary
    let first = state.step(1).unwrap();
    assert!(first.is_complete());
    assert_eq!(first.result_summary.as_deref(), Some("Wrote Part one"));
    assert!(state.step(2).unwrap().is_pending());
    assert!(state.step(3).unwrap().is_pending());

    let notice = state.last_assistant_message().unwrap();
    assert_eq!(notice.name.as_deref(), Some("engine"));
    assert!(notice.content.contains("stopped"));

    let checkpoint = h.store.load(&key).await.unwrap().unwrap();
    assert_eq!(checkpoint.next, Route::End);
    assert!(matches!(checkpoint.state.status, RunStatus::Aborted { .. }));
}

#[tokio::test]
async fn test_default_budget_is_enough_for_a_normal_plan() {
    let h = harness_with(three_writer_steps(), ScriptedRenderer::png(), fast_limits());
    let key = CheckpointKey::new("u_test", "thread-ok");

    let outcome = h
        .engine
        .invoke(&key, RunInput::new("A very long deck"))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(h.generation.count("writer"), 3);
}

#[tokio::test]
async fn test_research_budget_counts_inner_steps() {
    let generation = ScriptedGeneration::new(|request| match request.node.as_str() {
        "coordinator" => Ok(handoff("Fisheries", "data_report")),
        "planner" => Ok(plan(vec![
            step(
                "researcher",
                "Research perspectives:\n- catch\n- quotas\n- prices\n- labor\n- climate",
                &[],
            ),
            step("writer", "Write the report", &[1]),
        ])),
        "research_worker" => research_reply(request),
        other => panic!("unexpected node {}", other),
    });

    // One task per round needs 11 inner steps for five tasks, over the budget of 7
    let config = EngineConfig {
        limits: fast_limits(),
        research: ResearchSettings {
            parallelism: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let h = harness_with_config(generation, ScriptedRenderer::png(), config);
    let key = CheckpointKey::new("u_test", "thread-research-budget");

    let outcome = h
        .engine
        .invoke(&key, RunInput::new("Report on North Sea fisheries"))
        .await
        .unwrap();

    match &outcome.status {
        RunStatus::Aborted { reason } => assert!(reason.contains("'research'")),
        other => panic!("expected abort, got {:?}", other),
    }
    assert_eq!(h.generation.count("research_worker"), 3);
    assert_eq!(h.generation.count("writer"), 0);

    let state = &outcome.state;
    assert_eq!(state.research, ResearchState::default());
    let research_step = state.step(1).unwrap();
    assert!(research_step.is_complete());
    assert!(research_step
        .result_summary
        .as_deref()
        .unwrap()
        .starts_with("Aborted:"));
    assert!(state.step(2).unwrap().is_pending());
}

#[tokio::test]
async fn test_thread_accepts_new_message_after_abort() {
    let limits = SafetyLimits {
        max_graph_steps: 4,
        ..fast_limits()
    };
    let h = harness_with(three_writer_steps(), ScriptedRenderer::png(), limits);
    let key = CheckpointKey::new("u_test", "thread-after-abort");

    let first = h.engine.invoke(&key, RunInput::new("A very long deck")).await.unwrap();
    assert!(matches!(first.status, RunStatus::Aborted { .. }));

    // Nothing to resume: the aborted run was finalized
    let resumed = h.engine.resume(&key).await.unwrap();
    assert_eq!(resumed.steps_taken, 0);

    let second = h.engine.invoke(&key, RunInput::new("Try again")).await.unwrap();
    assert!(matches!(second.status, RunStatus::Aborted { .. }));
    assert_eq!(h.generation.count("coordinator"), 2);
}
