//! Research manager: decompose, dispatch by position, aggregate.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{emit_quietly, ProgressEmitter};
use crate::domain::{
    ArtifactEnvelope, ArtifactType, Capability, EventType, ImageCandidate, Message,
    ProductType, ProgressEvent, ResearchResult, ResearchState, RunState, RunStatus,
    SearchMode, Source, StatePatch, Step, StepUpdate,
};

use super::super::error::EngineError;
use super::super::graph::{Node, NodeId, RouteDecision};
use super::decompose::decompose;
use super::{ResearchPatterns, ResearchSettings};

pub const STATE_INCONSISTENT_CHECK: &str = "research_manager_state_inconsistent";
pub const PARTIAL_FAILURE_CHECK: &str = "research_partial_failure";
pub const ALL_FAILED_CHECK: &str = "all_research_failed";

/// Merged view of every result of one decomposition
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub content: serde_json::Value,
    pub summary: String,
    pub failed: usize,
    pub total: usize,
}

impl Aggregate {
    pub fn is_degraded(&self) -> bool {
        self.total == 0 || self.failed > 0
    }
}

/// Merge results in accumulated order.
///
/// Sources are deduplicated by URL (first occurrence wins), image
/// candidates likewise. Confidence is the mean over successful results.
pub fn aggregate(results: &[ResearchResult]) -> Aggregate {
    let total = results.len();
    let failed = results.iter().filter(|r| r.is_failed()).count();

    let mut report = Vec::with_capacity(total);
    let mut sections = Vec::with_capacity(total);
    for result in results {
        let body = match &result.error {
            Some(error) => format!("_No findings: {}_", error),
            None => result.report.clone(),
        };
        report.push(format!("## {}\n\n{}", result.perspective, body));
        sections.push(json!({
            "task_id": result.task_id,
            "perspective": result.perspective,
            "report": result.report,
            "error": result.error,
        }));
    }

    let mut seen = HashSet::new();
    let sources: Vec<&Source> = results
        .iter()
        .flat_map(|r| r.sources.iter())
        .filter(|s| seen.insert(s.url.as_str()))
        .collect();

    let mut seen = HashSet::new();
    let images: Vec<&ImageCandidate> = results
        .iter()
        .flat_map(|r| r.image_candidates.iter())
        .filter(|i| seen.insert(i.url.as_str()))
        .collect();

    let succeeded: Vec<f64> = results
        .iter()
        .filter(|r| !r.is_failed())
        .map(|r| r.confidence)
        .collect();
    let confidence = if succeeded.is_empty() {
        0.0
    } else {
        succeeded.iter().sum::<f64>() / succeeded.len() as f64
    };

    let failed_checks: Vec<&str> = if failed == total {
        vec![ALL_FAILED_CHECK]
    } else if failed > 0 {
        vec![PARTIAL_FAILURE_CHECK]
    } else {
        Vec::new()
    };

    let summary = if failed == 0 {
        format!(
            "Researched {} perspectives with {} sources",
            total,
            sources.len()
        )
    } else {
        format!(
            "Researched {} perspectives ({} failed) with {} sources",
            total,
            failed,
            sources.len()
        )
    };

    let mut content = json!({
        "report": report.join("\n\n"),
        "sections": sections,
        "sources": sources,
        "image_candidates": images,
        "confidence": confidence,
        "degraded": total == 0 || failed > 0,
        "failed_checks": failed_checks,
        "summary": summary,
    });
    if failed == total {
        content["error"] = json!("All research tasks failed.");
    }

    Aggregate {
        content,
        summary,
        failed,
        total,
    }
}

/// Describe why the dispatch bookkeeping cannot be trusted, if it can't
fn inconsistency(research: &ResearchState) -> Option<String> {
    if research.current_task_index > research.tasks.len() {
        return Some(format!(
            "dispatch index {} exceeds {} tasks",
            research.current_task_index,
            research.tasks.len()
        ));
    }
    if research.results.len() != research.current_task_index {
        return Some(format!(
            "{} results recorded for {} dispatched tasks",
            research.results.len(),
            research.current_task_index
        ));
    }
    None
}

/// Decomposes a researcher step and drives its tasks to completion
pub struct ResearchManager {
    patterns: Arc<ResearchPatterns>,
    settings: ResearchSettings,
    emitter: Arc<dyn ProgressEmitter>,
}

impl ResearchManager {
    pub fn new(
        patterns: Arc<ResearchPatterns>,
        settings: ResearchSettings,
        emitter: Arc<dyn ProgressEmitter>,
    ) -> Self {
        Self {
            patterns,
            settings,
            emitter,
        }
    }

    fn dispatch(&self, state: &RunState, step: &Step, mut research: ResearchState) -> RouteDecision {
        let start = research.current_task_index;
        let end = (start + self.settings.width()).min(research.tasks.len());
        research.current_task_index = end;

        debug!(step = step.id, start, end, "Dispatching research batch");
        emit_quietly(
            self.emitter.as_ref(),
            ProgressEvent::new(
                &state.thread_id,
                NodeId::ResearchManager.as_str(),
                EventType::ResearchDispatched,
                format!(
                    "Researching perspectives {}-{} of {}",
                    start + 1,
                    end,
                    research.tasks.len()
                ),
            )
            .with_step(step.id),
        );

        RouteDecision::goto(NodeId::ResearchWorker, StatePatch::new().research(research))
    }

    fn fail_inconsistent(&self, state: &RunState, step: &Step, reason: String) -> RouteDecision {
        warn!(step = step.id, %reason, "Research state is inconsistent, stopping run");

        let summary = format!("Research stopped: {}", reason);
        let artifact = ArtifactEnvelope::new(
            step.id,
            ArtifactType::Research,
            NodeId::ResearchManager.as_str(),
            state.product_type.unwrap_or_default(),
            json!({
                "error": reason,
                "failed_checks": [STATE_INCONSISTENT_CHECK],
                "summary": summary,
            }),
        );

        emit_quietly(
            self.emitter.as_ref(),
            ProgressEvent::new(
                &state.thread_id,
                NodeId::ResearchManager.as_str(),
                EventType::StepDegraded,
                &summary,
            )
            .with_step(step.id)
            .with_error(&reason),
        );

        RouteDecision::end(
            StatePatch::new()
                .artifact(artifact)
                .update(StepUpdate::Summarize {
                    step_id: step.id,
                    summary: summary.clone(),
                })
                .update(StepUpdate::Complete { step_id: step.id })
                .research(ResearchState::default())
                .status(RunStatus::Failed {
                    error: summary.clone(),
                })
                .message(Message::assistant(
                    NodeId::ResearchManager.as_str(),
                    format!("{}. The run was stopped; please send the request again.", summary),
                )),
        )
    }

    fn finish(&self, state: &RunState, step: &Step) -> RouteDecision {
        let merged = aggregate(&state.research.results);
        info!(
            step = step.id,
            total = merged.total,
            failed = merged.failed,
            "Research aggregated"
        );

        let artifact = ArtifactEnvelope::new(
            step.id,
            ArtifactType::Research,
            NodeId::ResearchManager.as_str(),
            state.product_type.unwrap_or_default(),
            merged.content.clone(),
        );

        let mut event = ProgressEvent::new(
            &state.thread_id,
            NodeId::ResearchManager.as_str(),
            EventType::ResearchAggregated,
            &merged.summary,
        )
        .with_step(step.id);
        if merged.is_degraded() {
            event = event.with_error(format!("{} of {} research tasks failed", merged.failed, merged.total));
        }
        emit_quietly(self.emitter.as_ref(), event);
        emit_quietly(
            self.emitter.as_ref(),
            ProgressEvent::new(
                &state.thread_id,
                NodeId::ResearchManager.as_str(),
                EventType::StepCompleted,
                format!("Completed {}", step.label()),
            )
            .with_step(step.id),
        );

        RouteDecision::goto(
            NodeId::Supervisor,
            StatePatch::new()
                .artifact(artifact)
                .update(StepUpdate::Summarize {
                    step_id: step.id,
                    summary: merged.summary,
                })
                .update(StepUpdate::Complete { step_id: step.id })
                .research(ResearchState::default()),
        )
    }
}

#[async_trait]
impl Node for ResearchManager {
    fn id(&self) -> NodeId {
        NodeId::ResearchManager
    }

    #[instrument(skip_all, fields(thread = %state.thread_id))]
    async fn run(&self, state: &RunState) -> Result<RouteDecision, EngineError> {
        let Some(step) = state
            .in_progress_step()
            .filter(|s| s.capability == Capability::Researcher)
        else {
            debug!("No research step in progress");
            return Ok(RouteDecision::goto(NodeId::Supervisor, StatePatch::new()));
        };

        let research = &state.research;

        if !research.is_owned_by(step.id) {
            let search_mode = match state.product_type.unwrap_or_default() {
                ProductType::DataReport => SearchMode::Text,
                ProductType::Slide | ProductType::Comic => SearchMode::TextAndImages,
            };
            let tasks = decompose(step, &self.patterns, &self.settings, search_mode);
            info!(step = step.id, tasks = tasks.len(), "Research step decomposed");
            return Ok(self.dispatch(state, step, ResearchState::decomposed(step.id, tasks)));
        }

        if let Some(reason) = inconsistency(research) {
            return Ok(self.fail_inconsistent(state, step, reason));
        }

        if research.current_task_index == research.tasks.len() {
            return Ok(self.finish(state, step));
        }

        Ok(self.dispatch(state, step, research.clone()))
    }
}
