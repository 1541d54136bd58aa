//! Engine error taxonomy.
//!
//! Step-local failures are absorbed into artifacts and step summaries by the
//! nodes themselves. What reaches the interpreter as an `EngineError` ends
//! the invocation with a recorded terminal status.

use thiserror::Error;

use crate::adapters::CapabilityError;
use crate::domain::StateInconsistency;

use super::graph::NodeId;

/// Plan rejected before execution (user-actionable)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanValidationError {
    #[error("The plan has no steps")]
    EmptyPlan,

    #[error("The request asks for sourced information but the plan has no research step")]
    MissingResearchStep,

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: u32, dependency: u32 },

    #[error("Step {step} depends on step {dependency} which comes later in the plan")]
    ForwardDependency { step: u32, dependency: u32 },
}

/// Graph wiring and budget errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Node '{0}' is not part of graph '{1}'")]
    UnknownNode(NodeId, &'static str),

    #[error("Edge {from} -> {to} is not declared in graph '{graph}'")]
    UndeclaredEdge {
        graph: &'static str,
        from: NodeId,
        to: String,
    },

    #[error("Graph '{graph}' exhausted its step budget of {limit}")]
    BudgetExhausted { graph: &'static str, limit: u32 },

    #[error("Graph '{graph}' ran past its timeout ({elapsed_seconds}s >= {limit_seconds}s)")]
    RunTimeout {
        graph: &'static str,
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}

/// Errors that end an invocation
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Plan validation failed: {0}")]
    PlanValidation(#[from] PlanValidationError),

    #[error("Capability invocation failed: {0}")]
    CapabilityInvocation(#[from] CapabilityError),

    #[error("State inconsistency: {0}")]
    StateInconsistency(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

impl From<StateInconsistency> for EngineError {
    fn from(e: StateInconsistency) -> Self {
        Self::StateInconsistency(e.0)
    }
}

impl EngineError {
    /// Whether the error came from a step budget or timeout ceiling
    pub fn is_budget(&self) -> bool {
        matches!(
            self,
            Self::Graph(GraphError::BudgetExhausted { .. } | GraphError::RunTimeout { .. })
        )
    }
}
