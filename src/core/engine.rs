//! Engine: drives the compiled graph for one invocation.
//!
//! Loads the thread's checkpoint, appends the new user turn, runs the
//! outer graph under the run timeout and checkpoints after every outer
//! step. Budget and timeout aborts are finalized into a recorded terminal
//! state so the next turn starts from a consistent plan.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{error, info, instrument, warn};

use crate::adapters::{emit_quietly, ProgressEmitter};
use crate::domain::{
    EventType, Message, ProductType, ProgressEvent, ResearchState, RunState, RunStatus,
    StatePatch, StepUpdate,
};

use super::checkpoint::{Checkpoint, CheckpointKey, CheckpointStore};
use super::coordinator::NAMESPACE_KEY;
use super::error::EngineError;
use super::graph::{Graph, NodeId, Route, StepObserver};
use super::planner::PREVIOUS_STATUS_KEY;
use super::safety::SafetyLimits;

/// A new user turn
#[derive(Debug, Clone)]
pub struct RunInput {
    pub message: String,

    /// Overrides the thread's product type when set
    pub product_type: Option<ProductType>,
}

impl RunInput {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            product_type: None,
        }
    }

    pub fn with_product_type(mut self, product_type: ProductType) -> Self {
        self.product_type = Some(product_type);
        self
    }
}

/// Result of one invocation
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: RunState,
    pub status: RunStatus,

    /// Outer node executions in this invocation
    pub steps_taken: u32,
}

/// Saves a checkpoint after every outer step
struct Checkpointer<'a> {
    store: &'a dyn CheckpointStore,
    key: &'a CheckpointKey,
    steps: AtomicU32,
}

#[async_trait]
impl StepObserver for Checkpointer<'_> {
    async fn after_step(&self, node: NodeId, state: &RunState, next: Route) -> Result<(), EngineError> {
        let steps = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
        let checkpoint = Checkpoint::new(self.key.clone(), state.clone(), next, steps);
        self.store
            .save(&checkpoint)
            .await
            .map_err(|e| EngineError::Checkpoint(format!("after {}: {:#}", node, e)))
    }
}

/// Patch that closes any dangling step and clears research progress
fn settle(state: &RunState, summary: &str) -> StatePatch {
    let mut patch = StatePatch::new();

    if let Some(step) = state.in_progress_step() {
        if step.result_summary.is_none() {
            patch = patch.update(StepUpdate::Summarize {
                step_id: step.id,
                summary: summary.to_string(),
            });
        }
        patch = patch.update(StepUpdate::Complete { step_id: step.id });
    }

    if state.research != ResearchState::default() {
        patch = patch.research(ResearchState::default());
    }

    patch
}

pub struct Engine {
    graph: Graph,
    store: Arc<dyn CheckpointStore>,
    emitter: Arc<dyn ProgressEmitter>,
    limits: SafetyLimits,
}

impl Engine {
    pub fn new(
        graph: Graph,
        store: Arc<dyn CheckpointStore>,
        emitter: Arc<dyn ProgressEmitter>,
        limits: SafetyLimits,
    ) -> Self {
        Self {
            graph,
            store,
            emitter,
            limits,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    async fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, EngineError> {
        self.store
            .load(key)
            .await
            .map_err(|e| EngineError::Checkpoint(format!("{:#}", e)))
    }

    async fn save(&self, key: &CheckpointKey, state: &RunState, steps: u32) -> Result<(), EngineError> {
        let checkpoint = Checkpoint::new(key.clone(), state.clone(), Route::End, steps);
        self.store
            .save(&checkpoint)
            .await
            .map_err(|e| EngineError::Checkpoint(format!("{:#}", e)))
    }

    fn event(&self, state: &RunState, event: EventType, summary: String) -> ProgressEvent {
        ProgressEvent::new(&state.thread_id, "engine", event, summary)
    }

    /// Handle a new user message on a thread
    #[instrument(skip(self, input), fields(key = %key))]
    pub async fn invoke(&self, key: &CheckpointKey, input: RunInput) -> Result<RunOutcome, EngineError> {
        let mut state = match self.load(key).await? {
            Some(checkpoint) => {
                if checkpoint.is_resumable() {
                    warn!(next = %checkpoint.next, "Previous run was interrupted, closing it before the new turn");
                }
                checkpoint.state
            }
            None => RunState::new(&key.thread_id),
        };

        // A turn arriving mid-run closes whatever was left open
        state.apply(settle(&state, "Interrupted by a new message"))?;

        let previous_status = state.status.label();
        let mut turn = StatePatch::new()
            .message(Message::user(input.message))
            .status(RunStatus::Running)
            .scratch(
                PREVIOUS_STATUS_KEY,
                serde_json::Value::String(previous_status.to_string()),
            )
            .scratch(NAMESPACE_KEY, serde_json::Value::String(key.namespace.clone()));
        turn.product_type = input.product_type;
        state.apply(turn)?;

        info!(messages = state.messages.len(), "Starting invocation");
        emit_quietly(
            self.emitter.as_ref(),
            self.event(&state, EventType::RunStarted, "Run started".to_string()),
        );

        self.drive(key, state, NodeId::Coordinator).await
    }

    /// Continue an interrupted run from its last step boundary
    #[instrument(skip(self), fields(key = %key))]
    pub async fn resume(&self, key: &CheckpointKey) -> Result<RunOutcome, EngineError> {
        let checkpoint = self
            .load(key)
            .await?
            .ok_or_else(|| EngineError::Checkpoint(format!("No checkpoint for thread {}", key)))?;

        let start = match checkpoint.next {
            Route::Node(node) => node,
            Route::End => {
                info!("Nothing to resume");
                let status = checkpoint.state.status.clone();
                return Ok(RunOutcome {
                    state: checkpoint.state,
                    status,
                    steps_taken: 0,
                });
            }
        };

        let mut state = checkpoint.state;
        state.apply(StatePatch::new().status(RunStatus::Running))?;

        info!(start = %start, "Resuming run");
        emit_quietly(
            self.emitter.as_ref(),
            self.event(&state, EventType::RunStarted, format!("Run resumed at {}", start)),
        );

        self.drive(key, state, start).await
    }

    async fn drive(&self, key: &CheckpointKey, mut state: RunState, start: NodeId) -> Result<RunOutcome, EngineError> {
        let started = Instant::now();
        let observer = Checkpointer {
            store: self.store.as_ref(),
            key,
            steps: AtomicU32::new(0),
        };

        let result = tokio::time::timeout(
            self.limits.run_timeout(),
            self.graph.drive(start, &mut state, Some(&observer as &dyn StepObserver)),
        )
        .await;

        let steps_taken = observer.steps.load(Ordering::SeqCst);
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(outcome)) => {
                info!(
                    steps = outcome.steps,
                    status = state.status.label(),
                    duration_ms,
                    "Invocation finished"
                );
                emit_quietly(
                    self.emitter.as_ref(),
                    self.event(&state, EventType::RunFinished, format!("Run {}", state.status.label()))
                        .with_duration(duration_ms),
                );
                Ok(RunOutcome {
                    status: state.status.clone(),
                    state,
                    steps_taken: outcome.steps,
                })
            }
            Ok(Err(e)) if e.is_budget() => {
                self.abort(key, state, e.to_string(), steps_taken, duration_ms)
                    .await
            }
            Err(_) => {
                let reason = format!(
                    "Run timed out after {}s",
                    self.limits.run_timeout_seconds
                );
                self.abort(key, state, reason, steps_taken, duration_ms).await
            }
            Ok(Err(EngineError::Checkpoint(message))) => {
                error!(%message, "Checkpoint write failed");
                Err(EngineError::Checkpoint(message))
            }
            Ok(Err(e)) => self.fail(key, state, e, steps_taken, duration_ms).await,
        }
    }

    /// Record a budget or timeout stop
    async fn abort(
        &self,
        key: &CheckpointKey,
        mut state: RunState,
        reason: String,
        steps_taken: u32,
        duration_ms: u64,
    ) -> Result<RunOutcome, EngineError> {
        warn!(%reason, steps_taken, "Run aborted");

        let patch = settle(&state, &format!("Aborted: {}", reason))
            .status(RunStatus::Aborted {
                reason: reason.clone(),
            })
            .message(Message::assistant(
                "engine",
                format!(
                    "The run was stopped: {}. Completed steps are kept; send a new message to continue.",
                    reason
                ),
            ));
        state.apply(patch)?;
        self.save(key, &state, steps_taken).await?;

        emit_quietly(
            self.emitter.as_ref(),
            self.event(&state, EventType::RunAborted, "Run aborted".to_string())
                .with_duration(duration_ms)
                .with_error(&reason),
        );

        Ok(RunOutcome {
            status: state.status.clone(),
            state,
            steps_taken,
        })
    }

    /// Record an unrecoverable error as a failed run
    async fn fail(
        &self,
        key: &CheckpointKey,
        mut state: RunState,
        error: EngineError,
        steps_taken: u32,
        duration_ms: u64,
    ) -> Result<RunOutcome, EngineError> {
        error!(error = %error, "Run failed");
        let message = error.to_string();

        let patch = settle(&state, &format!("Failed: {}", message))
            .status(RunStatus::Failed {
                error: message.clone(),
            })
            .message(Message::assistant(
                "engine",
                format!("The run failed: {}.", message),
            ));
        state.apply(patch)?;
        self.save(key, &state, steps_taken).await?;

        emit_quietly(
            self.emitter.as_ref(),
            self.event(&state, EventType::RunFinished, "Run failed".to_string())
                .with_duration(duration_ms)
                .with_error(&message),
        );

        Ok(RunOutcome {
            status: state.status.clone(),
            state,
            steps_taken,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Capability, Step};

    #[test]
    fn test_settle_closes_dangling_step() {
        let mut state = RunState::new("t");
        state
            .apply(StatePatch::new().plan(vec![
                Step::new(1, Capability::Researcher, "research"),
                Step::new(2, Capability::Writer, "write").depending_on([1]),
            ]))
            .unwrap();
        state
            .apply(
                StatePatch::new()
                    .update(StepUpdate::Start { step_id: 1 })
                    .research(ResearchState::decomposed(1, Vec::new())),
            )
            .unwrap();

        state.apply(settle(&state, "Aborted: budget")).unwrap();

        let step = state.step(1).unwrap();
        assert!(step.is_complete());
        assert_eq!(step.result_summary.as_deref(), Some("Aborted: budget"));
        assert!(state.step(2).unwrap().is_pending());
        assert_eq!(state.research, ResearchState::default());
    }

    #[test]
    fn test_settle_on_quiet_state_is_empty() {
        let state = RunState::new("t");
        assert!(settle(&state, "unused").is_empty());
    }
}
