//! Parallel research sub-workflow.
//!
//! A researcher step is run as a nested graph: the manager decomposes the
//! step into perspectives, dispatches them by position in bounded batches
//! and aggregates once every dispatched task has a result. The worker runs
//! one batch concurrently and fills the result slots in dispatch order.

pub mod decompose;
pub mod manager;
pub mod worker;

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use decompose::{decompose, parse_bullet};
pub use manager::{aggregate, ResearchManager};
pub use worker::ResearchWorker;

/// Research settings (the `research` config section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSettings {
    /// Tasks dispatched per manager invocation (default: 3)
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Minimum perspectives after decomposition (default: 2)
    #[serde(default = "default_min_tasks")]
    pub min_tasks: usize,

    /// Maximum perspectives after decomposition (default: 5)
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,

    /// Lines that introduce a bulleted list of perspectives
    #[serde(default = "default_perspective_markers")]
    pub perspective_markers: Vec<String>,

    /// User phrases that require a researcher step in the plan
    #[serde(default = "default_signal_patterns")]
    pub signal_patterns: Vec<String>,
}

fn default_parallelism() -> usize {
    3
}
fn default_min_tasks() -> usize {
    2
}
fn default_max_tasks() -> usize {
    5
}

fn default_perspective_markers() -> Vec<String> {
    [
        r"(?i)research\s+perspectives?",
        r"(?i)perspectives?\s+to\s+(research|investigate)",
        r"調査観点",
        r"リサーチ観点",
        r"調査の観点",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_signal_patterns() -> Vec<String> {
    [
        r"(?i)\bcite\b.*\bsources?\b",
        r"(?i)\bwith\s+(sources|citations|references)\b",
        r"(?i)\bbased\s+on\s+(research|evidence|data)\b",
        r"(?i)\bfact[- ]check",
        r"(?i)\breferences?\s+required\b",
        r"出典",
        r"根拠",
        r"参考文献",
        r"引用元",
        r"エビデンス",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            min_tasks: default_min_tasks(),
            max_tasks: default_max_tasks(),
            perspective_markers: default_perspective_markers(),
            signal_patterns: default_signal_patterns(),
        }
    }
}

/// Rejected research settings
#[derive(Debug, Error)]
pub enum ResearchSettingsError {
    #[error("Invalid research pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("research.min_tasks must be at least 2, got {0}")]
    TooFewTasks(usize),

    #[error("research.max_tasks ({max}) is below research.min_tasks ({min})")]
    MaxBelowMin { min: usize, max: usize },
}

impl ResearchSettings {
    /// Check the task bounds and compile the configured pattern sets
    pub fn compile(&self) -> Result<ResearchPatterns, ResearchSettingsError> {
        // A single perspective defeats the point of fanning out
        if self.min_tasks < 2 {
            return Err(ResearchSettingsError::TooFewTasks(self.min_tasks));
        }
        if self.max_tasks < self.min_tasks {
            return Err(ResearchSettingsError::MaxBelowMin {
                min: self.min_tasks,
                max: self.max_tasks,
            });
        }

        Ok(ResearchPatterns {
            perspective_markers: RegexSet::new(&self.perspective_markers)?,
            signals: RegexSet::new(&self.signal_patterns)?,
        })
    }

    /// Batch width, never zero
    pub fn width(&self) -> usize {
        self.parallelism.max(1)
    }
}

/// Compiled pattern sets shared by the planner and the research manager
#[derive(Debug, Clone)]
pub struct ResearchPatterns {
    pub perspective_markers: RegexSet,
    pub signals: RegexSet,
}

impl ResearchPatterns {
    /// Whether the text asks for sourced information
    pub fn requires_research(&self, text: &str) -> bool {
        self.signals.is_match(text)
    }

    pub fn is_perspective_marker(&self, line: &str) -> bool {
        self.perspective_markers.is_match(line)
    }
}
