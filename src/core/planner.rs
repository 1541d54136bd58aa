//! Planner: turns a candidate plan into a validated, normalized plan.
//!
//! Candidate steps come from the planner capability with their own id
//! space. They are renumbered 1..n, their dependencies remapped and checked,
//! default modes and titles filled per product type, and finally the
//! research requirement is enforced against what the user asked for.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::adapters::{
    parse_output, GenerationCapability, GenerationRequest, OutputSchema,
};
use crate::domain::{
    Capability, Message, ProductType, RunState, RunStatus, StatePatch, Step, TargetScope,
};

use super::error::{EngineError, PlanValidationError};
use super::graph::{Node, NodeId, RouteDecision};
use super::research::ResearchPatterns;
use super::retry::call_with_retry;
use super::safety::SafetyLimits;

/// Scratch key holding the status the thread had before the current turn
pub const PREVIOUS_STATUS_KEY: &str = "previous_status";

/// What the research guard reads: the current turn, plus the turn before it
/// when that one was rejected and this is the follow-up
fn request_text(state: &RunState) -> String {
    let follows_rejection = state
        .scratch
        .get(PREVIOUS_STATUS_KEY)
        .and_then(|v| v.as_str())
        == Some("rejected");
    state.recent_user_text(if follows_rejection { 2 } else { 1 })
}

/// One step as proposed by the planner capability
#[derive(Debug, Clone, Deserialize)]
pub struct CandidateStep {
    #[serde(default)]
    pub id: Option<u32>,
    pub capability: Capability,
    #[serde(default)]
    pub mode: Option<String>,
    pub instruction: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<u32>,
    #[serde(default)]
    pub target_scope: Option<TargetScope>,
}

#[derive(Debug, Deserialize)]
struct CandidatePlan {
    steps: Vec<CandidateStep>,
}

/// Assign sequential ids and remap dependencies.
///
/// A candidate without an id is known by its 1-based position. When ids
/// repeat, later dependencies resolve to the most recent earlier step.
pub fn build_plan(candidates: Vec<CandidateStep>) -> Result<Vec<Step>, PlanValidationError> {
    if candidates.is_empty() {
        return Err(PlanValidationError::EmptyPlan);
    }

    let candidate_ids: Vec<u32> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| c.id.unwrap_or(i as u32 + 1))
        .collect();

    let mut earlier: HashMap<u32, u32> = HashMap::new();
    let mut plan = Vec::with_capacity(candidates.len());

    for (position, candidate) in candidates.into_iter().enumerate() {
        let id = position as u32 + 1;
        let mut step = Step::new(id, candidate.capability, candidate.instruction);
        step.mode = candidate.mode.filter(|m| !m.trim().is_empty());
        step.title = candidate.title.trim().to_string();
        step.description = candidate.description;
        step.target_scope = candidate.target_scope;

        for dep in candidate.depends_on {
            match earlier.get(&dep) {
                Some(mapped) => {
                    step.depends_on.insert(*mapped);
                }
                None if candidate_ids.contains(&dep) => {
                    return Err(PlanValidationError::ForwardDependency {
                        step: id,
                        dependency: dep,
                    })
                }
                None => {
                    return Err(PlanValidationError::UnknownDependency {
                        step: id,
                        dependency: dep,
                    })
                }
            }
        }

        earlier.insert(candidate_ids[position], id);
        plan.push(step);
    }

    Ok(plan)
}

/// Default mode for a step without one
fn default_mode(product: ProductType, capability: Capability, has_framework: &mut bool) -> &'static str {
    match (product, capability) {
        (_, Capability::Researcher) => "web_research",
        (_, Capability::DataAnalyst) => "data_analysis",
        (ProductType::Slide, Capability::Writer) => "slide_outline",
        (ProductType::Slide, Capability::Visualizer) => "slide_render",
        (ProductType::Comic, Capability::Writer) => {
            if *has_framework {
                "comic_script"
            } else {
                *has_framework = true;
                "story_framework"
            }
        }
        (ProductType::Comic, Capability::Visualizer) => "comic_page_render",
        (ProductType::DataReport, Capability::Writer) => "report_draft",
        (ProductType::DataReport, Capability::Visualizer) => "chart_render",
    }
}

fn default_title(step: &Step) -> String {
    let what = step
        .mode
        .as_deref()
        .unwrap_or_else(|| step.capability.as_str())
        .replace('_', " ");
    format!("Step {}: {}", step.id, what)
}

/// Fill missing modes and titles. Never reorders or inserts steps, and
/// applying it twice gives the same plan.
pub fn normalize_plan(product: ProductType, mut plan: Vec<Step>) -> Vec<Step> {
    let mut has_framework = plan.iter().any(|s| {
        s.capability == Capability::Writer && s.mode.as_deref() == Some("story_framework")
    });

    for step in plan.iter_mut() {
        if step.mode.is_none() {
            step.mode = Some(default_mode(product, step.capability, &mut has_framework).to_string());
        }
        if step.title.trim().is_empty() {
            step.title = default_title(step);
        }
    }

    plan
}

/// Reject a plan without a researcher step when the user asked for sourced content
pub fn validate_research_requirement(
    plan: &[Step],
    patterns: &ResearchPatterns,
    user_text: &str,
) -> Result<(), PlanValidationError> {
    let has_research = plan.iter().any(|s| s.capability == Capability::Researcher);
    if !has_research && patterns.requires_research(user_text) {
        return Err(PlanValidationError::MissingResearchStep);
    }
    Ok(())
}

/// Build, normalize and validate in one pass
pub fn prepare_plan(
    candidates: Vec<CandidateStep>,
    product: ProductType,
    patterns: &ResearchPatterns,
    user_text: &str,
) -> Result<Vec<Step>, PlanValidationError> {
    let plan = normalize_plan(product, build_plan(candidates)?);
    validate_research_requirement(&plan, patterns, user_text)?;
    Ok(plan)
}

fn plan_summary(title: Option<&str>, plan: &[Step]) -> String {
    let mut lines = vec![match title {
        Some(title) => format!("Plan for \"{}\" ({} steps):", title, plan.len()),
        None => format!("Plan ({} steps):", plan.len()),
    }];
    for step in plan {
        lines.push(format!("{}. [{}] {}", step.id, step.capability, step.title));
    }
    lines.join("\n")
}

fn rejection_message(error: &PlanValidationError) -> String {
    match error {
        PlanValidationError::MissingResearchStep => "This request asks for sourced information, \
             but the proposed plan has no research step. Reply to confirm that a research step \
             should be added, or rephrase the request without the sourcing requirement."
            .to_string(),
        other => format!(
            "The proposed plan could not be used: {}. Please rephrase the request.",
            other
        ),
    }
}

pub struct Planner {
    capability: Arc<dyn GenerationCapability>,
    patterns: Arc<ResearchPatterns>,
    default_product_type: ProductType,
    limits: SafetyLimits,
}

impl Planner {
    pub fn new(
        capability: Arc<dyn GenerationCapability>,
        patterns: Arc<ResearchPatterns>,
        default_product_type: ProductType,
        limits: SafetyLimits,
    ) -> Self {
        Self {
            capability,
            patterns,
            default_product_type,
            limits,
        }
    }
}

#[async_trait]
impl Node for Planner {
    fn id(&self) -> NodeId {
        NodeId::Planner
    }

    #[instrument(skip_all, fields(thread = %state.thread_id))]
    async fn run(&self, state: &RunState) -> Result<RouteDecision, EngineError> {
        let product = state.product_type.unwrap_or(self.default_product_type);
        let request = request_text(state);

        let previous: Vec<_> = state
            .plan
            .iter()
            .map(|s| json!({"id": s.id, "capability": s.capability, "mode": s.mode, "title": s.title, "summary": s.result_summary}))
            .collect();
        let context = json!({
            "product_type": product,
            "title": state.title,
            "request": request,
            "conversation": state.user_text(),
            "previous_plan": previous,
        });

        let attempted = call_with_retry(
            &self.limits.retry,
            self.limits.max_retries,
            self.limits.step_timeout(),
            "planner",
            || {
                let request = GenerationRequest::new(
                    NodeId::Planner.as_str(),
                    OutputSchema::Plan,
                    "Produce an ordered execution plan for the request",
                )
                .with_context(context.clone());
                let capability = Arc::clone(&self.capability);
                async move { parse_output::<CandidatePlan>(capability.generate(request).await?) }
            },
        )
        .await;

        let candidates = match attempted.result {
            Ok(candidate) => candidate.steps,
            Err(e) => {
                warn!(error = %e, "Planner capability failed");
                let error = format!("Planning failed: {}", e);
                return Ok(RouteDecision::end(
                    StatePatch::new()
                        .message(Message::assistant(
                            NodeId::Planner.as_str(),
                            "Sorry, I could not put a plan together for this request. Please try again.",
                        ))
                        .status(RunStatus::Failed { error }),
                ));
            }
        };

        let plan = match prepare_plan(candidates, product, &self.patterns, &request) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "Plan rejected");
                return Ok(RouteDecision::end(
                    StatePatch::new()
                        .message(Message::assistant(NodeId::Planner.as_str(), rejection_message(&e)))
                        .status(RunStatus::Rejected {
                            reason: e.to_string(),
                        }),
                ));
            }
        };

        info!(steps = plan.len(), product_type = %product, "Plan accepted");

        let summary = plan_summary(state.title.as_deref(), &plan);
        Ok(RouteDecision::goto(
            NodeId::Supervisor,
            StatePatch::new()
                .plan(plan)
                .message(Message::assistant(NodeId::Planner.as_str(), summary)),
        ))
    }
}
