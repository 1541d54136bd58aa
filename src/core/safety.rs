//! Safety limits and enforcement for run execution.
//!
//! Prevents runaway execution through configurable limits on:
//! - Node executions in the outer plan loop
//! - Node executions in the nested research loop
//! - Retries per step
//! - Per-call and per-run timeouts

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Step;

use super::retry::RetryPolicy;

/// Safety limits for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum node executions in the outer graph (default: 50)
    #[serde(default = "default_max_graph_steps")]
    pub max_graph_steps: u32,

    /// Maximum node executions in the research sub-graph (default: 7)
    #[serde(default = "default_max_research_steps")]
    pub max_research_steps: u32,

    /// Retry ceiling per step (default: 2)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per capability call timeout in seconds (default: 300 = 5 min)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Total invocation timeout in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    /// Backoff between retries
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_graph_steps() -> u32 {
    50
}
fn default_max_research_steps() -> u32 {
    7
}
fn default_max_retries() -> u32 {
    2
}
fn default_step_timeout() -> u64 {
    300
} // 5 min
fn default_run_timeout() -> u64 {
    3600
} // 1 hour

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_graph_steps: default_max_graph_steps(),
            max_research_steps: default_max_research_steps(),
            max_retries: default_max_retries(),
            step_timeout_seconds: default_step_timeout(),
            run_timeout_seconds: default_run_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SafetyLimits {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    /// Retries a step may still consume
    pub fn remaining_retries(&self, step: &Step) -> u32 {
        self.max_retries.saturating_sub(step.retries_used)
    }
}

/// Tracks node executions of one graph drive
#[derive(Debug, Clone)]
pub struct SafetyTracker {
    /// Number of node executions
    pub steps_executed: u32,

    /// When the drive started
    pub started_at: Instant,
}

impl Default for SafetyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyTracker {
    /// Create a new tracker
    pub fn new() -> Self {
        Self {
            steps_executed: 0,
            started_at: Instant::now(),
        }
    }

    /// Record a node execution
    pub fn record_step(&mut self) {
        self.steps_executed += 1;
    }

    /// Get elapsed time in seconds
    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Check whether another node may run
    pub fn check(&self, max_steps: u32, run_timeout: Option<Duration>) -> Result<(), SafetyViolation> {
        if self.steps_executed >= max_steps {
            return Err(SafetyViolation::MaxSteps {
                actual: self.steps_executed,
                limit: max_steps,
            });
        }

        if let Some(limit) = run_timeout {
            if self.started_at.elapsed() >= limit {
                return Err(SafetyViolation::RunTimeout {
                    elapsed_seconds: self.elapsed_seconds(),
                    limit_seconds: limit.as_secs(),
                });
            }
        }

        Ok(())
    }
}

/// Safety violation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("Maximum steps exceeded: {actual} >= {limit}")]
    MaxSteps { actual: u32, limit: u32 },

    #[error("Run timeout: {elapsed_seconds}s >= {limit_seconds}s")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}
