//! Core orchestration logic.
//!
//! This module contains:
//! - Graph: named nodes, declared edges and the bounded interpreter
//! - Nodes: coordinator, planner, supervisor, workers, research sub-graph
//! - Builder: wires the nodes into the outer graph and the research sub-graph
//! - Engine: checkpointed invocations with abort finalization
//! - Safety / Retry: step budgets, timeouts and retry policy
//! - Checkpoint / EventLog: thread persistence and progress logging

pub mod builder;
pub mod checkpoint;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod graph;
pub mod planner;
pub mod research;
pub mod retry;
pub mod safety;
pub mod supervisor;
pub mod workers;

// Re-export commonly used types
pub use builder::{Builder, Capabilities, EngineConfig};
pub use checkpoint::{
    Checkpoint, CheckpointKey, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
    ThreadSummary,
};
pub use coordinator::Coordinator;
pub use engine::{Engine, RunInput, RunOutcome};
pub use error::{EngineError, GraphError, PlanValidationError};
pub use event_log::EventLog;
pub use graph::{DriveOutcome, Graph, Node, NodeId, Route, RouteDecision, StepObserver};
pub use planner::{
    build_plan, normalize_plan, prepare_plan, validate_research_requirement, CandidateStep,
    Planner,
};
pub use research::{ResearchManager, ResearchPatterns, ResearchSettings, ResearchWorker};
pub use retry::{call_with_retry, RetryPolicy};
pub use safety::{SafetyLimits, SafetyTracker, SafetyViolation};
pub use supervisor::Supervisor;
pub use workers::{ContentWorker, VisualizerWorker};
