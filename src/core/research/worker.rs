//! Research worker: resolves one dispatched batch concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::adapters::{parse_output, GenerationCapability, GenerationRequest, OutputSchema};
use crate::domain::{ImageCandidate, ResearchResult, ResearchTask, RunState, Source, StatePatch};

use super::super::error::EngineError;
use super::super::graph::{Node, NodeId, RouteDecision};
use super::super::retry::call_with_retry;
use super::super::safety::SafetyLimits;
use super::ResearchSettings;

/// Shape of one research capability response
#[derive(Debug, Deserialize)]
struct ResearchOutput {
    report: String,
    #[serde(default)]
    sources: Vec<Source>,
    #[serde(default)]
    image_candidates: Vec<ImageCandidate>,
    #[serde(default)]
    confidence: f64,
}

/// Runs every outstanding task of the current batch
pub struct ResearchWorker {
    capability: Arc<dyn GenerationCapability>,
    settings: ResearchSettings,
    limits: SafetyLimits,
}

impl ResearchWorker {
    pub fn new(
        capability: Arc<dyn GenerationCapability>,
        settings: ResearchSettings,
        limits: SafetyLimits,
    ) -> Self {
        Self {
            capability,
            settings,
            limits,
        }
    }

    /// One task, one result. Failures become a result with `error` set.
    async fn run_task(&self, task: &ResearchTask, step_instruction: &str) -> ResearchResult {
        let label = format!("research:{}", task.perspective);
        let attempted = call_with_retry(
            &self.limits.retry,
            self.limits.max_retries,
            self.limits.step_timeout(),
            &label,
            || {
                let request = GenerationRequest::new(
                    NodeId::ResearchWorker.as_str(),
                    OutputSchema::ResearchResult,
                    format!("Research the following perspective: {}", task.perspective),
                )
                .with_context(json!({
                    "perspective": task.perspective,
                    "query_hints": task.query_hints,
                    "expected_output": task.expected_output,
                    "search_mode": task.search_mode,
                    "priority": task.priority,
                    "step_instruction": step_instruction,
                }));
                let capability = Arc::clone(&self.capability);
                async move { parse_output::<ResearchOutput>(capability.generate(request).await?) }
            },
        )
        .await;

        match attempted.result {
            Ok(output) => ResearchResult {
                task_id: task.id,
                perspective: task.perspective.clone(),
                report: output.report,
                sources: output.sources,
                image_candidates: output.image_candidates,
                confidence: output.confidence.clamp(0.0, 1.0),
                error: None,
            },
            Err(e) => {
                warn!(perspective = %task.perspective, error = %e, "Research task failed");
                ResearchResult::failed(task, e.to_string())
            }
        }
    }
}

#[async_trait]
impl Node for ResearchWorker {
    fn id(&self) -> NodeId {
        NodeId::ResearchWorker
    }

    #[instrument(skip_all, fields(thread = %state.thread_id))]
    async fn run(&self, state: &RunState) -> Result<RouteDecision, EngineError> {
        let research = &state.research;
        let outstanding = research.outstanding();

        if outstanding.is_empty() || outstanding.end > research.tasks.len() {
            debug!(?outstanding, "Nothing to resolve, returning to manager");
            return Ok(RouteDecision::goto(NodeId::ResearchManager, StatePatch::new()));
        }

        let step_instruction: String = state
            .in_progress_step()
            .map(|s| s.instruction.clone())
            .unwrap_or_default();

        let first = outstanding.start;
        let batch: Vec<(usize, ResearchTask)> = outstanding
            .clone()
            .map(|index| (index, research.tasks[index].clone()))
            .collect();

        debug!(first, count = batch.len(), "Resolving research batch");

        let resolved: Vec<(usize, ResearchResult)> = stream::iter(batch)
            .map(|(index, task)| {
                let step_instruction = step_instruction.clone();
                async move { (index, self.run_task(&task, &step_instruction).await) }
            })
            .buffer_unordered(self.settings.width())
            .collect()
            .await;

        // Results land in their dispatch slot regardless of completion order
        let mut slots: Vec<Option<ResearchResult>> = vec![None; outstanding.len()];
        for (index, result) in resolved {
            slots[index - first] = Some(result);
        }

        let mut next = research.clone();
        next.results.extend(slots.into_iter().flatten());

        Ok(RouteDecision::goto(
            NodeId::ResearchManager,
            StatePatch::new().research(next),
        ))
    }
}
