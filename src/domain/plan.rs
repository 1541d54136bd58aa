//! Plan steps and the closed vocabularies they are built from.
//!
//! Steps are created by the planner only. Status transitions are checked
//! here so every component that mutates a step goes through the same rules.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Worker category a step is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Text writing (outlines, scripts, drafts)
    Writer,

    /// Image rendering
    Visualizer,

    /// Data analysis
    DataAnalyst,

    /// Parallel research sub-workflow
    Researcher,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Writer => "writer",
            Self::Visualizer => "visualizer",
            Self::DataAnalyst => "data_analyst",
            Self::Researcher => "researcher",
        }
    }

    pub const ALL: [Capability; 4] = [
        Self::Writer,
        Self::Visualizer,
        Self::DataAnalyst,
        Self::Researcher,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of deliverable a run produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    /// Slide deck
    Slide,

    /// Comic pages
    Comic,

    /// Data report
    DataReport,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slide => "slide",
            Self::Comic => "comic",
            Self::DataReport => "data_report",
        }
    }
}

impl Default for ProductType {
    fn default() -> Self {
        Self::Slide
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "slide" => Ok(Self::Slide),
            "comic" => Ok(Self::Comic),
            "data_report" => Ok(Self::DataReport),
            other => Err(other.to_string()),
        }
    }
}

/// Status of a plan step. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    Pending,

    /// Dispatched to a worker
    InProgress,

    /// Finished (successfully or degraded)
    Complete,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl StepStatus {
    /// The only status this one may move to, if any
    pub fn successor(&self) -> Option<StepStatus> {
        match self {
            Self::Pending => Some(Self::InProgress),
            Self::InProgress => Some(Self::Complete),
            Self::Complete => None,
        }
    }
}

/// Content units a step affects (slide numbers, character ids)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetScope {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slide_numbers: Vec<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub character_ids: Vec<String>,
}

/// One unit of planned work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within a plan, assigned at creation, never reused
    pub id: u32,

    /// Which worker type handles this step
    pub capability: Capability,

    /// Sub-behavior within the capability (e.g. "character_sheet")
    #[serde(default)]
    pub mode: Option<String>,

    /// Instruction handed to the worker
    pub instruction: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub description: String,

    /// Step ids that must be complete first
    #[serde(default)]
    pub depends_on: BTreeSet<u32>,

    #[serde(default)]
    pub status: StepStatus,

    /// Set by the owning worker once it has a result
    #[serde(default)]
    pub result_summary: Option<String>,

    /// Retries consumed so far (bounded by the retry ceiling)
    #[serde(default)]
    pub retries_used: u32,

    #[serde(default)]
    pub target_scope: Option<TargetScope>,
}

impl Step {
    /// Create a pending step
    pub fn new(id: u32, capability: Capability, instruction: impl Into<String>) -> Self {
        Self {
            id,
            capability,
            mode: None,
            instruction: instruction.into(),
            title: String::new(),
            description: String::new(),
            depends_on: BTreeSet::new(),
            status: StepStatus::Pending,
            result_summary: None,
            retries_used: 0,
            target_scope: None,
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn depending_on(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.depends_on.extend(ids);
        self
    }

    /// Move to the next status. Anything but the single forward move is rejected.
    pub fn advance_to(&mut self, next: StepStatus) -> Result<(), String> {
        match self.status.successor() {
            Some(allowed) if allowed == next => {
                self.status = next;
                Ok(())
            }
            _ => Err(format!(
                "step {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == StepStatus::Pending
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == StepStatus::InProgress
    }

    pub fn is_complete(&self) -> bool {
        self.status == StepStatus::Complete
    }

    /// Human label used in messages and logs
    pub fn label(&self) -> String {
        if self.title.is_empty() {
            format!("step {}", self.id)
        } else {
            format!("step {} ({})", self.id, self.title)
        }
    }
}

/// Check the structural plan invariants: unique ids, backward-only
/// dependencies, at most one step in progress.
pub fn check_plan_invariants(plan: &[Step]) -> Result<(), String> {
    let mut seen = BTreeSet::new();
    let mut in_progress = 0usize;

    for step in plan {
        for dep in &step.depends_on {
            if !seen.contains(dep) {
                return Err(format!(
                    "step {} depends on {} which does not precede it",
                    step.id, dep
                ));
            }
        }
        if !seen.insert(step.id) {
            return Err(format!("duplicate step id {}", step.id));
        }
        if step.is_in_progress() {
            in_progress += 1;
        }
    }

    if in_progress > 1 {
        return Err(format!("{} steps are in progress at once", in_progress));
    }

    Ok(())
}
