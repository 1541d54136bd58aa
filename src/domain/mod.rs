//! Domain types for the conductor engine.
//!
//! This module contains the core data structures:
//! - State: the run record and the patches nodes return
//! - Plan: steps, capabilities, product types
//! - Artifact: normalized worker outputs
//! - Research: tasks and results of the research sub-workflow
//! - Events: progress notifications

pub mod artifact;
pub mod events;
pub mod plan;
pub mod research;
pub mod state;

// Re-export commonly used types
pub use artifact::{artifact_key, ArtifactEnvelope, ArtifactType, EnvelopeError};
pub use events::{EventType, ProgressEvent};
pub use plan::{Capability, ProductType, Step, StepStatus, TargetScope};
pub use research::{
    ImageCandidate, ResearchResult, ResearchState, ResearchTask, SearchMode, Source,
};
pub use state::{
    Message, Role, RunState, RunStatus, StateInconsistency, StatePatch, StepUpdate,
};
