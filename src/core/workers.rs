//! Writer, data-analyst and visualizer workers.
//!
//! A worker picks up the in-progress step of its capability, produces
//! exactly one artifact for it and hands control back to the supervisor.
//! Failures never escape: they are written as a degraded artifact and a
//! step summary that carries the error text.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::adapters::{
    emit_quietly, parse_output, with_timeout, BlobStore, CapabilityError, GenerationCapability,
    GenerationRequest, ImageRenderer, OutputSchema, ProgressEmitter,
};
use crate::domain::{
    ArtifactEnvelope, ArtifactType, Capability, EventType, ProgressEvent, RunState, StatePatch,
    Step, StepUpdate,
};

use super::error::EngineError;
use super::graph::{Node, NodeId, RouteDecision};
use super::retry::call_with_retry;
use super::safety::SafetyLimits;

pub const ALL_IMAGES_FAILED: &str = "All visual image generations failed.";
pub const ALL_IMAGES_FAILED_CHECK: &str = "all_images_failed";
pub const SOME_IMAGES_FAILED_CHECK: &str = "some_images_failed";
pub const EMPTY_VISUAL_PLAN_CHECK: &str = "empty_visual_plan";

/// Structured context handed to every worker call
pub fn step_context(state: &RunState, step: &Step) -> Value {
    let dependencies: Vec<Value> = step
        .depends_on
        .iter()
        .filter_map(|id| state.step(*id))
        .map(|dep| {
            let prefix = format!("step_{}_", dep.id);
            let artifacts: Vec<&Value> = state
                .artifacts
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(_, artifact)| &artifact.content)
                .collect();
            json!({
                "step_id": dep.id,
                "title": dep.title,
                "capability": dep.capability,
                "summary": dep.result_summary,
                "artifacts": artifacts,
            })
        })
        .collect();

    json!({
        "product_type": state.product_type.unwrap_or_default(),
        "run_title": state.title,
        "request": state.user_text(),
        "step": {
            "id": step.id,
            "mode": step.mode,
            "title": step.title,
            "description": step.description,
            "target_scope": step.target_scope,
        },
        "dependencies": dependencies,
    })
}

/// Patch for a step whose capability call failed
fn degraded(
    state: &RunState,
    step: &Step,
    node: NodeId,
    artifact_type: ArtifactType,
    error: &str,
    check: &str,
    emitter: &dyn ProgressEmitter,
) -> StatePatch {
    let summary = format!("{} failed: {}", step.label(), error);
    warn!(step = step.id, node = %node, %error, "Step degraded");

    emit_quietly(
        emitter,
        ProgressEvent::new(&state.thread_id, node.as_str(), EventType::StepDegraded, &summary)
            .with_step(step.id)
            .with_error(error),
    );

    StatePatch::new()
        .artifact(ArtifactEnvelope::new(
            step.id,
            artifact_type,
            node.as_str(),
            state.product_type.unwrap_or_default(),
            json!({
                "error": error,
                "failed_checks": [check],
                "summary": summary,
            }),
        ))
        .update(StepUpdate::Summarize {
            step_id: step.id,
            summary,
        })
}

fn record_retries(patch: StatePatch, step: &Step, retries_used: u32) -> StatePatch {
    if retries_used == 0 {
        return patch;
    }
    patch.update(StepUpdate::RecordRetries {
        step_id: step.id,
        count: retries_used,
    })
}

/// Summary reported by the capability, if it gave a usable one
fn execution_summary(content: &Value) -> Option<String> {
    content
        .get("execution_summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Text-producing worker (writer, data analyst)
pub struct ContentWorker {
    node: NodeId,
    capability: Capability,
    artifact_type: ArtifactType,
    schema: OutputSchema,
    backend: Arc<dyn GenerationCapability>,
    limits: SafetyLimits,
    emitter: Arc<dyn ProgressEmitter>,
}

impl ContentWorker {
    pub fn writer(
        backend: Arc<dyn GenerationCapability>,
        limits: SafetyLimits,
        emitter: Arc<dyn ProgressEmitter>,
    ) -> Self {
        Self {
            node: NodeId::Writer,
            capability: Capability::Writer,
            artifact_type: ArtifactType::Writing,
            schema: OutputSchema::WriterOutput,
            backend,
            limits,
            emitter,
        }
    }

    pub fn data_analyst(
        backend: Arc<dyn GenerationCapability>,
        limits: SafetyLimits,
        emitter: Arc<dyn ProgressEmitter>,
    ) -> Self {
        Self {
            node: NodeId::DataAnalyst,
            capability: Capability::DataAnalyst,
            artifact_type: ArtifactType::DataAnalysis,
            schema: OutputSchema::DataAnalysis,
            backend,
            limits,
            emitter,
        }
    }
}

#[async_trait]
impl Node for ContentWorker {
    fn id(&self) -> NodeId {
        self.node
    }

    #[instrument(skip_all, fields(node = %self.node, thread = %state.thread_id))]
    async fn run(&self, state: &RunState) -> Result<RouteDecision, EngineError> {
        let Some(step) = state
            .in_progress_step()
            .filter(|s| s.capability == self.capability)
        else {
            debug!("No matching step in progress");
            return Ok(RouteDecision::goto(NodeId::Supervisor, StatePatch::new()));
        };

        let started = Instant::now();
        let context = step_context(state, step);
        let label = format!("{}:step_{}", self.node, step.id);

        let attempted = call_with_retry(
            &self.limits.retry,
            self.limits.remaining_retries(step),
            self.limits.step_timeout(),
            &label,
            || {
                let request = GenerationRequest::new(self.node.as_str(), self.schema, &step.instruction)
                    .with_mode(step.mode.clone())
                    .with_context(context.clone());
                let backend = Arc::clone(&self.backend);
                async move {
                    let value = backend.generate(request).await?;
                    if value.is_object() {
                        Ok(value)
                    } else {
                        Err(CapabilityError::Parse("expected a JSON object".to_string()))
                    }
                }
            },
        )
        .await;

        let patch = record_retries(StatePatch::new(), step, attempted.retries_used);

        let patch = match attempted.result {
            Ok(content) => {
                let summary = execution_summary(&content)
                    .unwrap_or_else(|| format!("{} finished {}", self.node, step.label()));
                info!(
                    step = step.id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Step produced its artifact"
                );

                patch
                    .artifact(ArtifactEnvelope::new(
                        step.id,
                        self.artifact_type,
                        self.node.as_str(),
                        state.product_type.unwrap_or_default(),
                        content,
                    ))
                    .update(StepUpdate::Summarize {
                        step_id: step.id,
                        summary,
                    })
            }
            Err(e) => {
                let degraded = degraded(
                    state,
                    step,
                    self.node,
                    self.artifact_type,
                    &e.to_string(),
                    e.check_name(),
                    self.emitter.as_ref(),
                );
                merge(patch, degraded)
            }
        };

        Ok(RouteDecision::goto(NodeId::Supervisor, patch))
    }
}

/// One prompt of a visual plan
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum VisualPrompt {
    Text(String),
    Detailed {
        prompt: String,
        #[serde(default)]
        caption: String,
    },
}

impl VisualPrompt {
    fn prompt(&self) -> &str {
        match self {
            Self::Text(prompt) => prompt,
            Self::Detailed { prompt, .. } => prompt,
        }
    }

    fn caption(&self) -> &str {
        match self {
            Self::Text(_) => "",
            Self::Detailed { caption, .. } => caption,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VisualPlan {
    prompts: Vec<VisualPrompt>,
    #[serde(default)]
    execution_summary: Option<String>,
}

/// Guess an image content type from its leading bytes
fn sniff_content_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG") {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        "image/jpeg"
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

/// Plans image prompts, renders them concurrently and stores the bytes
pub struct VisualizerWorker {
    planner: Arc<dyn GenerationCapability>,
    renderer: Arc<dyn ImageRenderer>,
    blobs: Arc<dyn BlobStore>,
    limits: SafetyLimits,
    emitter: Arc<dyn ProgressEmitter>,
}

impl VisualizerWorker {
    pub fn new(
        planner: Arc<dyn GenerationCapability>,
        renderer: Arc<dyn ImageRenderer>,
        blobs: Arc<dyn BlobStore>,
        limits: SafetyLimits,
        emitter: Arc<dyn ProgressEmitter>,
    ) -> Self {
        Self {
            planner,
            renderer,
            blobs,
            limits,
            emitter,
        }
    }

    async fn render_one(&self, prompt: &str) -> Result<String, CapabilityError> {
        let bytes = with_timeout(self.limits.step_timeout(), self.renderer.render(prompt)).await?;
        self.blobs
            .put(&bytes, sniff_content_type(&bytes))
            .await
            .map_err(|e| CapabilityError::Upstream(format!("blob store: {:#}", e)))
    }
}

#[async_trait]
impl Node for VisualizerWorker {
    fn id(&self) -> NodeId {
        NodeId::Visualizer
    }

    #[instrument(skip_all, fields(thread = %state.thread_id))]
    async fn run(&self, state: &RunState) -> Result<RouteDecision, EngineError> {
        let Some(step) = state
            .in_progress_step()
            .filter(|s| s.capability == Capability::Visualizer)
        else {
            debug!("No visualizer step in progress");
            return Ok(RouteDecision::goto(NodeId::Supervisor, StatePatch::new()));
        };

        let context = step_context(state, step);
        let label = format!("visualizer:step_{}", step.id);

        let attempted = call_with_retry(
            &self.limits.retry,
            self.limits.remaining_retries(step),
            self.limits.step_timeout(),
            &label,
            || {
                let request = GenerationRequest::new(
                    NodeId::Visualizer.as_str(),
                    OutputSchema::VisualPlan,
                    &step.instruction,
                )
                .with_mode(step.mode.clone())
                .with_context(context.clone());
                let planner = Arc::clone(&self.planner);
                async move { parse_output::<VisualPlan>(planner.generate(request).await?) }
            },
        )
        .await;

        let patch = record_retries(StatePatch::new(), step, attempted.retries_used);
        let emitter = self.emitter.as_ref();

        let plan = match attempted.result {
            Ok(plan) if !plan.prompts.is_empty() => plan,
            Ok(_) => {
                let degraded = degraded(
                    state,
                    step,
                    NodeId::Visualizer,
                    ArtifactType::Visual,
                    "The visual plan contained no prompts.",
                    EMPTY_VISUAL_PLAN_CHECK,
                    emitter,
                );
                return Ok(RouteDecision::goto(NodeId::Supervisor, merge(patch, degraded)));
            }
            Err(e) => {
                let degraded = degraded(
                    state,
                    step,
                    NodeId::Visualizer,
                    ArtifactType::Visual,
                    &e.to_string(),
                    e.check_name(),
                    emitter,
                );
                return Ok(RouteDecision::goto(NodeId::Supervisor, merge(patch, degraded)));
            }
        };

        let renders = join_all(plan.prompts.iter().map(|p| self.render_one(p.prompt()))).await;

        let mut images = Vec::new();
        let mut failures = Vec::new();
        for (index, (prompt, outcome)) in plan.prompts.iter().zip(renders).enumerate() {
            match outcome {
                Ok(url) => images.push(json!({
                    "index": index,
                    "prompt": prompt.prompt(),
                    "caption": prompt.caption(),
                    "url": url,
                })),
                Err(e) => {
                    warn!(step = step.id, index, error = %e, "Image generation failed");
                    failures.push(json!({
                        "index": index,
                        "prompt": prompt.prompt(),
                        "error": e.to_string(),
                        "check": e.check_name(),
                    }));
                }
            }
        }

        let total = plan.prompts.len();
        let product_type = state.product_type.unwrap_or_default();

        if images.is_empty() {
            let summary = format!("{} failed: all {} image generations failed", step.label(), total);
            emit_quietly(
                emitter,
                ProgressEvent::new(&state.thread_id, NodeId::Visualizer.as_str(), EventType::StepDegraded, &summary)
                    .with_step(step.id)
                    .with_error(ALL_IMAGES_FAILED),
            );
            let artifact = ArtifactEnvelope::new(
                step.id,
                ArtifactType::Visual,
                NodeId::Visualizer.as_str(),
                product_type,
                json!({
                    "error": ALL_IMAGES_FAILED,
                    "failed_checks": [ALL_IMAGES_FAILED_CHECK],
                    "failures": failures,
                    "summary": summary,
                }),
            );
            return Ok(RouteDecision::goto(
                NodeId::Supervisor,
                patch.artifact(artifact).update(StepUpdate::Summarize {
                    step_id: step.id,
                    summary,
                }),
            ));
        }

        let rendered = images.len();
        let summary = match plan.execution_summary.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() && failures.is_empty() => s.to_string(),
            _ if failures.is_empty() => format!("Rendered {} images", rendered),
            _ => format!("Rendered {} of {} images", rendered, total),
        };

        let mut content = json!({
            "images": images,
            "execution_summary": summary,
        });
        if !failures.is_empty() {
            content["failures"] = json!(failures);
            content["failed_checks"] = json!([SOME_IMAGES_FAILED_CHECK]);
            emit_quietly(
                emitter,
                ProgressEvent::new(&state.thread_id, NodeId::Visualizer.as_str(), EventType::StepDegraded, &summary)
                    .with_step(step.id)
                    .with_error(format!("{} of {} image generations failed", total - rendered, total)),
            );
        }

        info!(step = step.id, rendered, total, "Visual step rendered");

        Ok(RouteDecision::goto(
            NodeId::Supervisor,
            patch
                .artifact(ArtifactEnvelope::new(
                    step.id,
                    ArtifactType::Visual,
                    NodeId::Visualizer.as_str(),
                    product_type,
                    content,
                ))
                .update(StepUpdate::Summarize {
                    step_id: step.id,
                    summary,
                }),
        ))
    }
}

/// Append the updates and artifacts of `extra` to `base`
fn merge(mut base: StatePatch, extra: StatePatch) -> StatePatch {
    base.step_updates.extend(extra.step_updates);
    base.artifacts.extend(extra.artifacts);
    base.messages.extend(extra.messages);
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProductType;

    #[test]
    fn test_sniff_content_type() {
        assert_eq!(sniff_content_type(b"\x89PNG\r\n\x1a\n"), "image/png");
        assert_eq!(sniff_content_type(&[0xFF, 0xD8, 0xFF]), "image/jpeg");
        assert_eq!(sniff_content_type(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(sniff_content_type(b"hello"), "application/octet-stream");
    }

    #[test]
    fn test_visual_prompt_shapes() {
        let plan: VisualPlan = serde_json::from_value(json!({
            "prompts": ["a red bus", {"prompt": "a blue car", "caption": "Figure 2"}]
        }))
        .unwrap();
        assert_eq!(plan.prompts[0].prompt(), "a red bus");
        assert_eq!(plan.prompts[1].caption(), "Figure 2");
    }

    #[test]
    fn test_step_context_includes_dependency_artifacts() {
        let mut state = RunState::new("t");
        state.product_type = Some(ProductType::Slide);
        state
            .apply(StatePatch::new().plan(vec![
                Step::new(1, Capability::Researcher, "research"),
                Step::new(2, Capability::Writer, "write").depending_on([1]),
            ]))
            .unwrap();
        state
            .apply(StatePatch::new().artifact(ArtifactEnvelope::new(
                1,
                ArtifactType::Research,
                "research_manager",
                ProductType::Slide,
                json!({"report": "facts"}),
            )))
            .unwrap();

        let context = step_context(&state, state.step(2).unwrap());
        assert_eq!(context["dependencies"][0]["artifacts"][0]["report"], "facts");
        assert_eq!(context["product_type"], "slide");
    }

    #[test]
    fn test_execution_summary_ignores_blank() {
        assert_eq!(execution_summary(&json!({"execution_summary": "  "})), None);
        assert_eq!(
            execution_summary(&json!({"execution_summary": "Outline ready"})),
            Some("Outline ready".to_string())
        );
    }
}
