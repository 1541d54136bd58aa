//! Directed graph of named nodes and a bounded interpreter for it.
//!
//! Every node returns a `RouteDecision { next, patch }`. The interpreter
//! applies the patch, checks that the edge taken was declared, and moves on
//! until it reaches `__end__` or a route that leaves the graph. A graph can
//! contain another graph as a node; the nested graph runs with its own
//! step budget and hands its exit route back to the parent.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{Capability, RunState, StatePatch};

use super::error::{EngineError, GraphError};
use super::safety::{SafetyTracker, SafetyViolation};

/// Named node of the orchestration graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    Coordinator,
    Planner,
    Supervisor,
    Writer,
    Visualizer,
    DataAnalyst,
    /// Research sub-graph as seen from the outer graph
    Researcher,
    ResearchManager,
    ResearchWorker,
}

impl NodeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Planner => "planner",
            Self::Supervisor => "supervisor",
            Self::Writer => "writer",
            Self::Visualizer => "visualizer",
            Self::DataAnalyst => "data_analyst",
            Self::Researcher => "researcher",
            Self::ResearchManager => "research_manager",
            Self::ResearchWorker => "research_worker",
        }
    }

    /// Node that executes steps of a capability
    pub fn for_capability(capability: Capability) -> Self {
        match capability {
            Capability::Writer => Self::Writer,
            Capability::Visualizer => Self::Visualizer,
            Capability::DataAnalyst => Self::DataAnalyst,
            Capability::Researcher => Self::Researcher,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where execution goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "node")]
pub enum Route {
    Node(NodeId),
    End,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "{}", id),
            Self::End => f.write_str("__end__"),
        }
    }
}

/// What every node returns: the next route plus a state patch
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub next: Route,
    pub patch: StatePatch,
}

impl RouteDecision {
    pub fn goto(node: NodeId, patch: StatePatch) -> Self {
        Self {
            next: Route::Node(node),
            patch,
        }
    }

    pub fn end(patch: StatePatch) -> Self {
        Self {
            next: Route::End,
            patch,
        }
    }
}

/// A unit of the graph
#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> NodeId;

    /// Decide the next route from a read-only view of the state
    async fn run(&self, state: &RunState) -> Result<RouteDecision, EngineError>;
}

/// Called after every node of the outermost graph
#[async_trait]
pub trait StepObserver: Send + Sync {
    async fn after_step(&self, node: NodeId, state: &RunState, next: Route) -> Result<(), EngineError>;
}

enum GraphNode {
    Leaf(Arc<dyn Node>),
    Subgraph(Arc<Graph>),
}

/// How a drive ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveOutcome {
    /// `__end__` or the route that left the graph
    pub exit: Route,

    /// Node executions performed
    pub steps: u32,
}

/// Compiled graph with declared edges and a step budget
pub struct Graph {
    name: &'static str,
    entry: NodeId,
    nodes: HashMap<NodeId, GraphNode>,
    edges: HashMap<NodeId, HashSet<Route>>,
    exits: HashSet<Route>,
    max_steps: u32,
    run_timeout: Option<Duration>,
}

impl Graph {
    /// Start declaring a graph
    pub fn builder(name: &'static str, entry: NodeId, max_steps: u32) -> GraphBuilder {
        GraphBuilder {
            graph: Graph {
                name,
                entry,
                nodes: HashMap::new(),
                edges: HashMap::new(),
                exits: HashSet::from([Route::End]),
                max_steps,
                run_timeout: None,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn entry(&self) -> NodeId {
        self.entry
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    /// Successors declared for a node
    pub fn successors(&self, node: NodeId) -> Vec<Route> {
        let mut routes: Vec<Route> = self
            .edges
            .get(&node)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        routes.sort_by_key(|r| r.to_string());
        routes
    }

    fn check_edge(&self, from: NodeId, to: Route) -> Result<(), GraphError> {
        let declared = self
            .edges
            .get(&from)
            .map(|targets| targets.contains(&to))
            .unwrap_or(false);

        if declared {
            Ok(())
        } else {
            Err(GraphError::UndeclaredEdge {
                graph: self.name,
                from,
                to: to.to_string(),
            })
        }
    }

    fn violation_to_error(&self, violation: SafetyViolation) -> GraphError {
        match violation {
            SafetyViolation::MaxSteps { limit, .. } => GraphError::BudgetExhausted {
                graph: self.name,
                limit,
            },
            SafetyViolation::RunTimeout {
                elapsed_seconds,
                limit_seconds,
            } => GraphError::RunTimeout {
                graph: self.name,
                elapsed_seconds,
                limit_seconds,
            },
        }
    }

    /// Run from `start` until `__end__` or an exit route.
    ///
    /// Patches are applied atomically after each node returns, so the state
    /// is always at a node boundary when this future is dropped or fails.
    pub fn drive<'a>(
        &'a self,
        start: NodeId,
        state: &'a mut RunState,
        observer: Option<&'a dyn StepObserver>,
    ) -> BoxFuture<'a, Result<DriveOutcome, EngineError>> {
        async move {
            let mut tracker = SafetyTracker::new();
            let mut current = start;

            loop {
                if let Err(violation) = tracker.check(self.max_steps, self.run_timeout) {
                    warn!(graph = self.name, node = %current, %violation, "Graph stopped by safety limit");
                    return Err(self.violation_to_error(violation).into());
                }

                let node = self
                    .nodes
                    .get(&current)
                    .ok_or(GraphError::UnknownNode(current, self.name))?;
                tracker.record_step();

                debug!(
                    graph = self.name,
                    node = %current,
                    step = tracker.steps_executed,
                    "Executing node"
                );

                let next = match node {
                    GraphNode::Leaf(node) => {
                        let decision = node.run(&*state).await?;
                        state.apply(decision.patch)?;
                        decision.next
                    }
                    GraphNode::Subgraph(inner) => {
                        inner.drive(inner.entry, &mut *state, None).await?.exit
                    }
                };

                self.check_edge(current, next)?;

                if let Some(observer) = observer {
                    observer.after_step(current, &*state, next).await?;
                }

                match next {
                    Route::Node(id) if self.nodes.contains_key(&id) => current = id,
                    exit => {
                        debug!(graph = self.name, from = %current, exit = %exit, "Leaving graph");
                        return Ok(DriveOutcome {
                            exit,
                            steps: tracker.steps_executed,
                        });
                    }
                }
            }
        }
        .boxed()
    }
}

/// Declares nodes and edges, then validates the wiring
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn node(mut self, node: Arc<dyn Node>) -> Self {
        self.graph.nodes.insert(node.id(), GraphNode::Leaf(node));
        self
    }

    pub fn subgraph(mut self, id: NodeId, graph: Graph) -> Self {
        self.graph.nodes.insert(id, GraphNode::Subgraph(Arc::new(graph)));
        self
    }

    pub fn edge(mut self, from: NodeId, to: Route) -> Self {
        self.graph.edges.entry(from).or_default().insert(to);
        self
    }

    pub fn edges(mut self, from: NodeId, targets: impl IntoIterator<Item = Route>) -> Self {
        self.graph.edges.entry(from).or_default().extend(targets);
        self
    }

    /// Declare a route that leaves this graph for the parent
    pub fn exit(mut self, route: Route) -> Self {
        self.graph.exits.insert(route);
        self
    }

    pub fn run_timeout(mut self, limit: Duration) -> Self {
        self.graph.run_timeout = Some(limit);
        self
    }

    /// Check that the entry and every edge endpoint exist
    pub fn compile(self) -> Result<Graph, GraphError> {
        let graph = self.graph;

        if !graph.nodes.contains_key(&graph.entry) {
            return Err(GraphError::UnknownNode(graph.entry, graph.name));
        }

        for (from, targets) in &graph.edges {
            if !graph.nodes.contains_key(from) {
                return Err(GraphError::UnknownNode(*from, graph.name));
            }
            for target in targets {
                let known = match target {
                    Route::Node(id) => graph.nodes.contains_key(id),
                    Route::End => false,
                };
                if !known && !graph.exits.contains(target) {
                    return Err(GraphError::UndeclaredEdge {
                        graph: graph.name,
                        from: *from,
                        to: target.to_string(),
                    });
                }
            }
        }

        Ok(graph)
    }
}
