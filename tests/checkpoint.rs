//! Checkpoint Integration Tests
//!
//! Resuming interrupted runs, closing them when a new message arrives, and
//! the on-disk layout of checkpoints, titles and progress events.

mod common;

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use common::{handoff, harness, plan, step, MemoryBlobStore, ScriptedGeneration, ScriptedRenderer};
use conductor::core::{
    Builder, Capabilities, Checkpoint, CheckpointKey, CheckpointStore, EngineConfig, EventLog,
    FileCheckpointStore, NodeId, Route, RunInput,
};
use conductor::domain::{
    Capability, EventType, Message, ProductType, RunState, RunStatus, StatePatch, Step,
    StepUpdate,
};

/// A slide thread planned with a writer and a visualizer step
fn planned_state(thread_id: &str) -> RunState {
    let mut state = RunState::new(thread_id);
    let mut patch = StatePatch::new()
        .message(Message::user("Slides about tidal power"))
        .plan(vec![
            Step::new(1, Capability::Writer, "Write the outline").with_mode("slide_outline"),
            Step::new(2, Capability::Visualizer, "Render the slides")
                .with_mode("slide_render")
                .depending_on([1]),
        ])
        .status(RunStatus::Running);
    patch.product_type = Some(ProductType::Slide);
    state.apply(patch).unwrap();
    state
}

fn worker_generation() -> Arc<ScriptedGeneration> {
    ScriptedGeneration::new(|request| match request.node.as_str() {
        "coordinator" => Ok(json!({"decision": "reply_to_user", "message": "Sure, here is a joke."})),
        "writer" => Ok(json!({"execution_summary": "Outline ready"})),
        "visualizer" => Ok(json!({"prompts": ["tidal turbine"]})),
        other => panic!("unexpected node {}", other),
    })
}

#[tokio::test]
async fn test_resume_continues_from_stored_route() {
    let h = harness(worker_generation(), ScriptedRenderer::png());
    let key = CheckpointKey::new("u_test", "thread-resume");

    h.store
        .save(&Checkpoint::new(
            key.clone(),
            planned_state("thread-resume"),
            Route::Node(NodeId::Supervisor),
            3,
        ))
        .await
        .unwrap();

    let outcome = h.engine.resume(&key).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    // supervisor, writer, supervisor, visualizer, supervisor
    assert_eq!(outcome.steps_taken, 5);
    assert_eq!(h.generation.nodes(), vec!["writer", "visualizer"]);
    assert!(outcome.state.plan.iter().all(|s| s.is_complete()));

    let checkpoint = h.store.load(&key).await.unwrap().unwrap();
    assert_eq!(checkpoint.next, Route::End);
    assert!(!checkpoint.is_resumable());
}

#[tokio::test]
async fn test_resume_of_finished_thread_is_a_no_op() {
    let h = harness(worker_generation(), ScriptedRenderer::png());
    let key = CheckpointKey::new("u_test", "thread-done");

    let mut state = planned_state("thread-done");
    state.apply(StatePatch::new().status(RunStatus::Completed)).unwrap();
    h.store
        .save(&Checkpoint::new(key.clone(), state, Route::End, 9))
        .await
        .unwrap();

    let outcome = h.engine.resume(&key).await.unwrap();

    assert_eq!(outcome.steps_taken, 0);
    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(h.generation.calls().is_empty());
}

#[tokio::test]
async fn test_resume_without_checkpoint_is_an_error() {
    let h = harness(worker_generation(), ScriptedRenderer::png());
    let key = CheckpointKey::new("u_test", "missing");

    assert!(h.engine.resume(&key).await.is_err());
}

#[tokio::test]
async fn test_new_message_closes_interrupted_step() {
    let h = harness(worker_generation(), ScriptedRenderer::png());
    let key = CheckpointKey::new("u_test", "thread-interrupted");

    let mut state = planned_state("thread-interrupted");
    state
        .apply(StatePatch::new().update(StepUpdate::Start { step_id: 1 }))
        .unwrap();
    h.store
        .save(&Checkpoint::new(
            key.clone(),
            state,
            Route::Node(NodeId::Writer),
            4,
        ))
        .await
        .unwrap();

    let outcome = h
        .engine
        .invoke(&key, RunInput::new("Never mind, tell me a joke"))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Replied);
    assert_eq!(h.generation.nodes(), vec!["coordinator"]);

    let interrupted = outcome.state.step(1).unwrap();
    assert!(interrupted.is_complete());
    assert_eq!(
        interrupted.result_summary.as_deref(),
        Some("Interrupted by a new message")
    );
    assert!(outcome.state.step(2).unwrap().is_pending());
    assert!(outcome.state.in_progress_step().is_none());
}

#[tokio::test]
async fn test_file_store_persists_thread_and_events() {
    let temp = TempDir::new().unwrap();
    let threads = temp.path().join("threads");
    let key = CheckpointKey::new("u_file", "thread-disk");

    let generation = ScriptedGeneration::new(|request| match request.node.as_str() {
        "coordinator" => Ok(handoff("Tidal power", "slide")),
        "planner" => Ok(plan(vec![step("writer", "Write the outline", &[])])),
        "writer" => Ok(json!({"execution_summary": "Outline ready"})),
        other => panic!("unexpected node {}", other),
    });

    let store = Arc::new(FileCheckpointStore::new(&threads));
    let thread_dir = store.thread_dir(&key.namespace, &key.thread_id);
    let log = EventLog::for_thread_dir(&thread_dir).unwrap();

    let engine = Builder::new(
        EngineConfig {
            limits: common::fast_limits(),
            ..Default::default()
        },
        Capabilities::uniform(
            generation,
            ScriptedRenderer::png(),
            Arc::new(MemoryBlobStore::default()),
        ),
    )
    .emitter(Arc::new(log))
    .title_store(store.clone())
    .build(store.clone())
    .unwrap();

    let outcome = engine
        .invoke(&key, RunInput::new("Slides about tidal power"))
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);

    assert!(thread_dir.join("checkpoint.json").exists());
    assert!(thread_dir.join("meta.json").exists());

    // A fresh store instance sees the same thread
    let reopened = FileCheckpointStore::new(&threads);
    let checkpoint = reopened.load(&key).await.unwrap().unwrap();
    assert_eq!(checkpoint.state.status, RunStatus::Completed);
    assert_eq!(checkpoint.state.title.as_deref(), Some("Tidal power"));

    let threads = reopened.list("u_file").await.unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].thread_id, "thread-disk");
    assert_eq!(threads[0].status, "completed");
    assert!(reopened.list("someone_else").await.unwrap().is_empty());

    // Progress events were appended in order
    let events = EventLog::for_thread_dir(&thread_dir)
        .unwrap()
        .replay()
        .await
        .unwrap();
    assert_eq!(events.first().unwrap().event_type, EventType::RunStarted);
    assert_eq!(events.last().unwrap().event_type, EventType::RunFinished);
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::StepStarted && e.step_id == Some(1)));
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::StepCompleted && e.step_id == Some(1)));
}
