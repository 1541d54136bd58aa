//! conductor - plan-and-supervise orchestration engine
//!
//! Turns a conversational request into a multi-step content production
//! run (slides, comics, data reports). A coordinator decides whether to
//! plan, a planner produces a dependency-ordered plan, and a supervisor
//! dispatches each step to a specialized worker until the plan is done.
//!
//! # Architecture
//!
//! The system is built around an explicit graph:
//! - Nodes return a route decision plus a state patch
//! - The graph interpreter enforces declared edges and step budgets
//! - Research steps run as a bounded sub-graph with parallel fan-out
//! - State is checkpointed after every step, so interrupted runs resume
//!
//! # Modules
//!
//! - `adapters`: External collaborators (generation, rendering, blobs, progress)
//! - `core`: Graph, nodes, engine, checkpoints, safety limits
//! - `domain`: Data structures (RunState, Step, ArtifactEnvelope, events)
//! - `config`: Config file and environment resolution
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Start a thread
//! conductor run "Make a 5-slide deck on heat pumps" --product slide
//!
//! # Continue it
//! conductor run "Add a slide on costs" --thread <thread-id>
//!
//! # Resume an interrupted run
//! conductor resume <thread-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Builder, Capabilities, CheckpointKey, Engine, EngineConfig, RunInput, RunOutcome};
pub use domain::{ArtifactEnvelope, ProductType, RunState, RunStatus, StatePatch, Step};
