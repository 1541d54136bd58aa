//! Run state and the patches that mutate it.
//!
//! A `RunState` is the single record threaded through every node. Nodes
//! never touch it directly: they return a `StatePatch` which is applied
//! here, so the plan invariants are checked in exactly one place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::artifact::ArtifactEnvelope;
use super::plan::{check_plan_invariants, ProductType, Step, StepStatus};
use super::research::ResearchState;

/// Raised when a patch would break a plan or dispatch invariant
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StateInconsistency(pub String);

/// Who wrote a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    /// Node that authored an assistant message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub content: String,

    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            name: None,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn assistant(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            name: Some(name.into()),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Terminal or running status of the latest invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunStatus {
    /// Currently executing
    Running,

    /// Coordinator answered without planning
    Replied,

    /// Plan rejected before execution, waiting for the user
    Rejected { reason: String },

    /// Every plan step completed
    Completed,

    /// Run stopped on an unrecoverable condition
    Failed { error: String },

    /// Step budget or timeout reached
    Aborted { reason: String },
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Running
    }
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Replied => "replied",
            Self::Rejected { .. } => "rejected",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// The shared record threaded through every node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub thread_id: String,

    /// Append-only conversation
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Ordered plan (creation order)
    #[serde(default)]
    pub plan: Vec<Step>,

    /// Step results keyed by `step_<id>_<kind>`
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactEnvelope>,

    /// Artifacts of plans that were replaced by a later turn
    #[serde(default)]
    pub archived_artifacts: Vec<ArtifactEnvelope>,

    #[serde(default)]
    pub product_type: Option<ProductType>,

    #[serde(default)]
    pub title: Option<String>,

    /// Per-run scratch data owned by coordinator/planner/supervisor
    #[serde(default)]
    pub scratch: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub status: RunStatus,

    /// Research sub-workflow state
    #[serde(default)]
    pub research: ResearchState,
}

impl RunState {
    /// Fresh state for a thread
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            ..Default::default()
        }
    }

    pub fn step(&self, id: u32) -> Option<&Step> {
        self.plan.iter().find(|s| s.id == id)
    }

    fn step_mut(&mut self, id: u32) -> Result<&mut Step, StateInconsistency> {
        self.plan
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StateInconsistency(format!("unknown step {}", id)))
    }

    /// The step currently dispatched, if any
    pub fn in_progress_step(&self) -> Option<&Step> {
        self.plan.iter().find(|s| s.is_in_progress())
    }

    /// Text of every user message, oldest first
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Text of the last `turns` user messages, oldest first
    pub fn recent_user_text(&self, turns: usize) -> String {
        let mut recent: Vec<&str> = self
            .messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::User)
            .take(turns)
            .map(|m| m.content.as_str())
            .collect();
        recent.reverse();
        recent.join("\n")
    }

    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    pub fn last_assistant_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    /// Apply a patch. Either the whole patch lands or the state is untouched.
    pub fn apply(&mut self, patch: StatePatch) -> Result<(), StateInconsistency> {
        let mut next = self.clone();
        next.apply_in_place(patch)?;
        *self = next;
        Ok(())
    }

    fn apply_in_place(&mut self, patch: StatePatch) -> Result<(), StateInconsistency> {
        if let Some(plan) = patch.plan {
            if let Some(active) = self.in_progress_step() {
                return Err(StateInconsistency(format!(
                    "plan replaced while {} is in progress",
                    active.label()
                )));
            }
            check_plan_invariants(&plan).map_err(StateInconsistency)?;
            // Step ids restart with every plan; results of the old one must not leak in
            if !self.plan.is_empty() {
                let stale = std::mem::take(&mut self.artifacts);
                self.archived_artifacts.extend(stale.into_values());
            }
            self.plan = plan;
        }

        self.messages.extend(patch.messages);

        for update in patch.step_updates {
            self.apply_step_update(update)?;
        }

        for artifact in patch.artifacts {
            self.artifacts.insert(artifact.artifact_id.clone(), artifact);
        }

        if let Some(product_type) = patch.product_type {
            self.product_type = Some(product_type);
        }
        if let Some(title) = patch.title {
            self.title = Some(title);
        }
        self.scratch.extend(patch.scratch);
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(research) = patch.research {
            self.research = research;
        }

        Ok(())
    }

    fn apply_step_update(&mut self, update: StepUpdate) -> Result<(), StateInconsistency> {
        match update {
            StepUpdate::Start { step_id } => {
                if let Some(active) = self.in_progress_step() {
                    if active.id != step_id {
                        return Err(StateInconsistency(format!(
                            "cannot start step {} while {} is in progress",
                            step_id,
                            active.label()
                        )));
                    }
                }
                let step = self.step_mut(step_id)?;
                step.advance_to(StepStatus::InProgress)
                    .map_err(StateInconsistency)
            }
            StepUpdate::Complete { step_id } => {
                let step = self.step_mut(step_id)?;
                step.advance_to(StepStatus::Complete)
                    .map_err(StateInconsistency)
            }
            StepUpdate::Summarize { step_id, summary } => {
                let step = self.step_mut(step_id)?;
                if step.is_complete() {
                    return Err(StateInconsistency(format!(
                        "{} is already complete",
                        step.label()
                    )));
                }
                step.result_summary = Some(summary);
                Ok(())
            }
            StepUpdate::RecordRetries { step_id, count } => {
                let step = self.step_mut(step_id)?;
                step.retries_used += count;
                Ok(())
            }
        }
    }
}

/// A single mutation of one plan step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepUpdate {
    /// pending -> in_progress
    Start { step_id: u32 },

    /// in_progress -> complete
    Complete { step_id: u32 },

    /// Record the owning worker's summary
    Summarize { step_id: u32, summary: String },

    /// Add consumed retries
    RecordRetries { step_id: u32, count: u32 },
}

/// Partial update returned by a node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub messages: Vec<Message>,
    pub plan: Option<Vec<Step>>,
    pub step_updates: Vec<StepUpdate>,
    pub artifacts: Vec<ArtifactEnvelope>,
    pub product_type: Option<ProductType>,
    pub title: Option<String>,
    pub scratch: BTreeMap<String, serde_json::Value>,
    pub status: Option<RunStatus>,
    pub research: Option<ResearchState>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn plan(mut self, plan: Vec<Step>) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn update(mut self, update: StepUpdate) -> Self {
        self.step_updates.push(update);
        self
    }

    pub fn artifact(mut self, artifact: ArtifactEnvelope) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn research(mut self, research: ResearchState) -> Self {
        self.research = Some(research);
        self
    }

    pub fn scratch(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.scratch.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
