//! Supervisor: absorbs finished steps and dispatches the next one.
//!
//! Re-entered after every worker. Exactly one step is ever in progress,
//! and a step is only dispatched once everything it depends on is complete.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::adapters::{emit_quietly, ProgressEmitter};
use crate::domain::{
    EventType, Message, ProgressEvent, RunState, RunStatus, StatePatch, Step, StepStatus,
    StepUpdate,
};

use super::error::EngineError;
use super::graph::{Node, NodeId, RouteDecision};

/// First pending step whose dependencies are all complete
pub fn next_ready_step(plan: &[Step]) -> Option<&Step> {
    plan.iter().filter(|s| s.is_pending()).find(|s| {
        s.depends_on.iter().all(|dep| {
            plan.iter()
                .find(|other| other.id == *dep)
                .map(|other| other.is_complete())
                .unwrap_or(false)
        })
    })
}

fn final_report(plan: &[Step]) -> String {
    let mut lines = vec![format!("All {} steps are complete.", plan.len())];
    for step in plan {
        let summary = step.result_summary.as_deref().unwrap_or("done");
        lines.push(format!("- {}: {}", step.label(), summary));
    }
    lines.join("\n")
}

pub struct Supervisor {
    emitter: Arc<dyn ProgressEmitter>,
}

impl Supervisor {
    pub fn new(emitter: Arc<dyn ProgressEmitter>) -> Self {
        Self { emitter }
    }

    fn event(&self, state: &RunState, event_type: EventType, step: &Step, summary: String) {
        emit_quietly(
            self.emitter.as_ref(),
            ProgressEvent::new(&state.thread_id, NodeId::Supervisor.as_str(), event_type, summary)
                .with_step(step.id),
        );
    }
}

#[async_trait]
impl Node for Supervisor {
    fn id(&self) -> NodeId {
        NodeId::Supervisor
    }

    #[instrument(skip_all, fields(thread = %state.thread_id))]
    async fn run(&self, state: &RunState) -> Result<RouteDecision, EngineError> {
        let mut patch = StatePatch::new();

        // Plan as it will look once the absorb updates land
        let mut plan = state.plan.clone();

        if let Some(active) = state.in_progress_step() {
            if active.result_summary.is_none() {
                patch = patch.update(StepUpdate::Summarize {
                    step_id: active.id,
                    summary: format!("{} finished without a summary", active.label()),
                });
            }
            patch = patch.update(StepUpdate::Complete { step_id: active.id });
            self.event(
                state,
                EventType::StepCompleted,
                active,
                format!("Completed {}", active.label()),
            );
            info!(step = active.id, "Step absorbed");

            if let Some(step) = plan.iter_mut().find(|s| s.id == active.id) {
                step.status = StepStatus::Complete;
            }
        }

        if let Some(next) = next_ready_step(&plan) {
            let route = NodeId::for_capability(next.capability);
            self.event(
                state,
                EventType::StepStarted,
                next,
                format!("Starting {} with {}", next.label(), next.capability),
            );
            info!(step = next.id, node = %route, "Dispatching step");

            return Ok(RouteDecision::goto(
                route,
                patch.update(StepUpdate::Start { step_id: next.id }),
            ));
        }

        if plan.iter().all(|s| s.is_complete()) {
            info!(steps = plan.len(), "Plan complete");
            return Ok(RouteDecision::end(
                patch
                    .status(RunStatus::Completed)
                    .message(Message::assistant(NodeId::Supervisor.as_str(), final_report(&plan))),
            ));
        }

        let blocked: Vec<String> = plan
            .iter()
            .filter(|s| s.is_pending())
            .map(|s| s.label())
            .collect();
        let error = format!("No runnable step: {} cannot start", blocked.join(", "));
        warn!(%error, "Plan stalled");

        Ok(RouteDecision::end(
            patch
                .status(RunStatus::Failed {
                    error: error.clone(),
                })
                .message(Message::assistant(
                    NodeId::Supervisor.as_str(),
                    format!("The plan could not continue. {}.", error),
                )),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::NoopEmitter;
    use crate::core::graph::Route;
    use crate::domain::Capability;

    fn plan() -> Vec<Step> {
        vec![
            Step::new(1, Capability::Researcher, "research"),
            Step::new(2, Capability::Writer, "outline").depending_on([1]),
            Step::new(3, Capability::Visualizer, "render").depending_on([2]),
        ]
    }

    fn supervisor() -> Supervisor {
        Supervisor::new(Arc::new(NoopEmitter))
    }

    #[test]
    fn test_next_ready_step_respects_dependencies() {
        let mut steps = plan();
        assert_eq!(next_ready_step(&steps).map(|s| s.id), Some(1));

        steps[0].status = StepStatus::Complete;
        assert_eq!(next_ready_step(&steps).map(|s| s.id), Some(2));

        steps[1].status = StepStatus::InProgress;
        assert_eq!(next_ready_step(&steps), None);
    }

    #[tokio::test]
    async fn test_dispatches_first_step() {
        let mut state = RunState::new("t");
        state.apply(StatePatch::new().plan(plan())).unwrap();

        let decision = supervisor().run(&state).await.unwrap();
        assert_eq!(decision.next, Route::Node(NodeId::Researcher));

        state.apply(decision.patch).unwrap();
        assert_eq!(state.in_progress_step().map(|s| s.id), Some(1));
    }

    #[tokio::test]
    async fn test_absorbs_and_dispatches_in_one_turn() {
        let mut state = RunState::new("t");
        state.apply(StatePatch::new().plan(plan())).unwrap();
        state
            .apply(StatePatch::new().update(StepUpdate::Start { step_id: 1 }))
            .unwrap();

        let decision = supervisor().run(&state).await.unwrap();
        state.apply(decision.patch).unwrap();

        let step1 = state.step(1).unwrap();
        assert!(step1.is_complete());
        assert!(step1.result_summary.is_some());
        assert_eq!(state.in_progress_step().map(|s| s.id), Some(2));
    }

    #[tokio::test]
    async fn test_completes_when_nothing_left() {
        let mut state = RunState::new("t");
        state
            .apply(StatePatch::new().plan(vec![Step::new(1, Capability::Writer, "write")]))
            .unwrap();
        state
            .apply(StatePatch::new().update(StepUpdate::Start { step_id: 1 }))
            .unwrap();

        let decision = supervisor().run(&state).await.unwrap();
        assert_eq!(decision.next, Route::End);
        state.apply(decision.patch).unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(state
            .last_assistant_message()
            .unwrap()
            .content
            .starts_with("All 1 steps are complete."));
    }
}
