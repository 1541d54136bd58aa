//! Research sub-workflow records.
//!
//! Tasks for one decomposition are produced together and dispatched by
//! position. Task ids may repeat across perspectives; nothing here is keyed
//! by them.

use serde::{Deserialize, Serialize};

/// One independent angle of inquiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchTask {
    pub id: u32,
    pub perspective: String,
    #[serde(default)]
    pub query_hints: Vec<String>,
    /// 1 is the highest priority
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub expected_output: String,
    #[serde(default)]
    pub search_mode: SearchMode,
}

fn default_priority() -> u32 {
    1
}

/// How a research worker should search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Text sources
    Text,

    /// Text sources plus candidate images
    TextAndImages,
}

impl Default for SearchMode {
    fn default() -> Self {
        Self::Text
    }
}

/// A cited source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub title: String,
    pub url: String,
}

/// An image worth considering for the deliverable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageCandidate {
    pub url: String,
    #[serde(default)]
    pub caption: String,
}

/// Outcome of one research task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchResult {
    pub task_id: u32,
    pub perspective: String,
    #[serde(default)]
    pub report: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub image_candidates: Vec<ImageCandidate>,
    /// Confidence in [0, 1]
    #[serde(default)]
    pub confidence: f64,
    /// Set when the task could not be resolved
    #[serde(default)]
    pub error: Option<String>,
}

impl ResearchResult {
    /// A result slot for a task that failed
    pub fn failed(task: &ResearchTask, error: impl Into<String>) -> Self {
        Self {
            task_id: task.id,
            perspective: task.perspective.clone(),
            report: String::new(),
            sources: Vec::new(),
            image_candidates: Vec::new(),
            confidence: 0.0,
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Sequential dispatch state of the research manager
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchState {
    /// Plan step this decomposition belongs to
    #[serde(default)]
    pub step_id: Option<u32>,

    #[serde(default)]
    pub is_decomposed: bool,

    #[serde(default)]
    pub tasks: Vec<ResearchTask>,

    /// Position of the next task to dispatch
    #[serde(default)]
    pub current_task_index: usize,

    /// Results in dispatch order
    #[serde(default)]
    pub results: Vec<ResearchResult>,
}

impl ResearchState {
    /// Fresh state for a new decomposition
    pub fn decomposed(step_id: u32, tasks: Vec<ResearchTask>) -> Self {
        Self {
            step_id: Some(step_id),
            is_decomposed: true,
            tasks,
            current_task_index: 0,
            results: Vec::new(),
        }
    }

    /// Positions dispatched but not yet resolved
    pub fn outstanding(&self) -> std::ops::Range<usize> {
        self.results.len()..self.current_task_index
    }

    pub fn is_owned_by(&self, step_id: u32) -> bool {
        self.is_decomposed && self.step_id == Some(step_id)
    }
}
