//! Wires the nodes into the outer graph and the research sub-graph.
//!
//! ```text
//! coordinator -> planner | __end__
//! planner     -> supervisor | __end__
//! supervisor  -> writer | visualizer | data_analyst | researcher | __end__
//! workers     -> supervisor
//! researcher  -> supervisor | __end__
//!     research_manager -> research_worker | supervisor | __end__
//!     research_worker  -> research_manager
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::{
    BlobStore, GenerationCapability, ImageRenderer, NoopEmitter, ProgressEmitter, TitleStore,
};
use crate::domain::ProductType;

use super::checkpoint::CheckpointStore;
use super::coordinator::Coordinator;
use super::engine::Engine;
use super::graph::{Graph, NodeId, Route};
use super::planner::Planner;
use super::research::{ResearchManager, ResearchSettings, ResearchWorker};
use super::safety::SafetyLimits;
use super::supervisor::Supervisor;
use super::workers::{ContentWorker, VisualizerWorker};

/// Explicit engine settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub limits: SafetyLimits,

    #[serde(default)]
    pub research: ResearchSettings,

    /// Product type when neither the thread nor the request names one
    #[serde(default)]
    pub default_product_type: ProductType,
}

/// External collaborators, one generation backend per node
#[derive(Clone)]
pub struct Capabilities {
    pub coordinator: Arc<dyn GenerationCapability>,
    pub planner: Arc<dyn GenerationCapability>,
    pub writer: Arc<dyn GenerationCapability>,
    pub visualizer: Arc<dyn GenerationCapability>,
    pub data_analyst: Arc<dyn GenerationCapability>,
    pub researcher: Arc<dyn GenerationCapability>,
    pub renderer: Arc<dyn ImageRenderer>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Capabilities {
    /// Same generation backend for every node
    pub fn uniform(
        generation: Arc<dyn GenerationCapability>,
        renderer: Arc<dyn ImageRenderer>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            coordinator: Arc::clone(&generation),
            planner: Arc::clone(&generation),
            writer: Arc::clone(&generation),
            visualizer: Arc::clone(&generation),
            data_analyst: Arc::clone(&generation),
            researcher: generation,
            renderer,
            blobs,
        }
    }
}

/// Compiles the graphs and assembles an engine
pub struct Builder {
    config: EngineConfig,
    capabilities: Capabilities,
    emitter: Arc<dyn ProgressEmitter>,
    title_store: Option<Arc<dyn TitleStore>>,
}

impl Builder {
    pub fn new(config: EngineConfig, capabilities: Capabilities) -> Self {
        Self {
            config,
            capabilities,
            emitter: Arc::new(NoopEmitter),
            title_store: None,
        }
    }

    pub fn emitter(mut self, emitter: Arc<dyn ProgressEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn title_store(mut self, store: Arc<dyn TitleStore>) -> Self {
        self.title_store = Some(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Build the research sub-graph and the outer graph
    pub fn compile(&self) -> Result<Graph> {
        let config = &self.config;
        let caps = &self.capabilities;
        let limits = &config.limits;

        let patterns = Arc::new(
            config
                .research
                .compile()
                .context("Invalid research settings in configuration")?,
        );

        let research = Graph::builder("research", NodeId::ResearchManager, limits.max_research_steps)
            .node(Arc::new(ResearchManager::new(
                Arc::clone(&patterns),
                config.research.clone(),
                Arc::clone(&self.emitter),
            )))
            .node(Arc::new(ResearchWorker::new(
                Arc::clone(&caps.researcher),
                config.research.clone(),
                limits.clone(),
            )))
            .edges(
                NodeId::ResearchManager,
                [
                    Route::Node(NodeId::ResearchWorker),
                    Route::Node(NodeId::Supervisor),
                    Route::End,
                ],
            )
            .edge(NodeId::ResearchWorker, Route::Node(NodeId::ResearchManager))
            .exit(Route::Node(NodeId::Supervisor))
            .compile()?;

        let supervisor_targets = [
            Route::Node(NodeId::Writer),
            Route::Node(NodeId::Visualizer),
            Route::Node(NodeId::DataAnalyst),
            Route::Node(NodeId::Researcher),
            Route::End,
        ];

        let graph = Graph::builder("main", NodeId::Coordinator, limits.max_graph_steps)
            .node(Arc::new(Coordinator::new(
                Arc::clone(&caps.coordinator),
                self.title_store.clone(),
                config.default_product_type,
                limits.clone(),
                Arc::clone(&self.emitter),
            )))
            .node(Arc::new(Planner::new(
                Arc::clone(&caps.planner),
                Arc::clone(&patterns),
                config.default_product_type,
                limits.clone(),
            )))
            .node(Arc::new(Supervisor::new(Arc::clone(&self.emitter))))
            .node(Arc::new(ContentWorker::writer(
                Arc::clone(&caps.writer),
                limits.clone(),
                Arc::clone(&self.emitter),
            )))
            .node(Arc::new(ContentWorker::data_analyst(
                Arc::clone(&caps.data_analyst),
                limits.clone(),
                Arc::clone(&self.emitter),
            )))
            .node(Arc::new(VisualizerWorker::new(
                Arc::clone(&caps.visualizer),
                Arc::clone(&caps.renderer),
                Arc::clone(&caps.blobs),
                limits.clone(),
                Arc::clone(&self.emitter),
            )))
            .subgraph(NodeId::Researcher, research)
            .edges(NodeId::Coordinator, [Route::Node(NodeId::Planner), Route::End])
            .edges(NodeId::Planner, [Route::Node(NodeId::Supervisor), Route::End])
            .edges(NodeId::Supervisor, supervisor_targets)
            .edge(NodeId::Writer, Route::Node(NodeId::Supervisor))
            .edge(NodeId::Visualizer, Route::Node(NodeId::Supervisor))
            .edge(NodeId::DataAnalyst, Route::Node(NodeId::Supervisor))
            .edges(NodeId::Researcher, [Route::Node(NodeId::Supervisor), Route::End])
            .run_timeout(limits.run_timeout())
            .compile()?;

        Ok(graph)
    }

    /// Compile and attach a checkpoint store
    pub fn build(self, store: Arc<dyn CheckpointStore>) -> Result<Engine> {
        let graph = self.compile()?;
        Ok(Engine::new(graph, store, self.emitter, self.config.limits))
    }
}
