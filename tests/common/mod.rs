//! Shared fixtures for engine integration tests.
//!
//! Scripted collaborators answer by node name and record every request,
//! so tests can assert both the final state and which calls were made.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use conductor::adapters::{
    BlobStore, CapabilityError, GenerationCapability, GenerationRequest, ImageRenderer,
};
use conductor::core::{
    Builder, Capabilities, Engine, EngineConfig, MemoryCheckpointStore, RetryPolicy, SafetyLimits,
};

type Responder = dyn Fn(&GenerationRequest) -> Result<Value, CapabilityError> + Send + Sync;

/// Generation backend driven by a closure
pub struct ScriptedGeneration {
    responder: Box<Responder>,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGeneration {
    pub fn new(
        responder: impl Fn(&GenerationRequest) -> Result<Value, CapabilityError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Node names in call order
    pub fn nodes(&self) -> Vec<String> {
        self.calls().into_iter().map(|r| r.node).collect()
    }

    pub fn count(&self, node: &str) -> usize {
        self.calls().iter().filter(|r| r.node == node).count()
    }
}

#[async_trait]
impl GenerationCapability for ScriptedGeneration {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<Value, CapabilityError> {
        self.calls.lock().unwrap().push(request.clone());
        (self.responder)(&request)
    }
}

/// Renderer driven by a closure over the prompt
pub struct ScriptedRenderer {
    responder: Box<dyn Fn(&str) -> Result<Vec<u8>, CapabilityError> + Send + Sync>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedRenderer {
    pub fn new(
        responder: impl Fn(&str) -> Result<Vec<u8>, CapabilityError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            prompts: Mutex::new(Vec::new()),
        })
    }

    /// Always returns a tiny PNG
    pub fn png() -> Arc<Self> {
        Self::new(|_| Ok(b"\x89PNG\r\n\x1a\nfake".to_vec()))
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageRenderer for ScriptedRenderer {
    async fn render(&self, prompt: &str) -> Result<Vec<u8>, CapabilityError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        (self.responder)(prompt)
    }
}

/// Blob store keeping bytes in memory under `mem://` URLs
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, (String, Vec<u8>)>>,
}

impl MemoryBlobStore {
    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: &[u8], content_type: &str) -> anyhow::Result<String> {
        let mut blobs = self.blobs.lock().unwrap();
        let url = format!("mem://{}", blobs.len() + 1);
        blobs.insert(url.clone(), (content_type.to_string(), bytes.to_vec()));
        Ok(url)
    }

    async fn get(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(url)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| anyhow::anyhow!("No blob at {}", url))
    }
}

/// Limits with no backoff so retries don't slow tests down
pub fn fast_limits() -> SafetyLimits {
    SafetyLimits {
        step_timeout_seconds: 5,
        run_timeout_seconds: 30,
        retry: RetryPolicy::immediate(),
        ..Default::default()
    }
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryCheckpointStore>,
    pub generation: Arc<ScriptedGeneration>,
    pub renderer: Arc<ScriptedRenderer>,
    pub blobs: Arc<MemoryBlobStore>,
}

pub fn harness(generation: Arc<ScriptedGeneration>, renderer: Arc<ScriptedRenderer>) -> Harness {
    harness_with(generation, renderer, fast_limits())
}

pub fn harness_with(
    generation: Arc<ScriptedGeneration>,
    renderer: Arc<ScriptedRenderer>,
    limits: SafetyLimits,
) -> Harness {
    let config = EngineConfig {
        limits,
        ..Default::default()
    };
    harness_with_config(generation, renderer, config)
}

pub fn harness_with_config(
    generation: Arc<ScriptedGeneration>,
    renderer: Arc<ScriptedRenderer>,
    config: EngineConfig,
) -> Harness {
    let store = Arc::new(MemoryCheckpointStore::new());
    let blobs = Arc::new(MemoryBlobStore::default());
    let capabilities = Capabilities::uniform(generation.clone(), renderer.clone(), blobs.clone());

    let engine = Builder::new(config, capabilities)
        .title_store(store.clone())
        .build(store.clone())
        .unwrap();

    Harness {
        engine,
        store,
        generation,
        renderer,
        blobs,
    }
}

/// Coordinator response handing the request to the planner
pub fn handoff(title: &str, product_type: &str) -> Value {
    json!({
        "decision": "handoff_to_planner",
        "message": "On it.",
        "title": title,
        "product_type": product_type,
    })
}

/// One candidate step as the planner capability would return it
pub fn step(capability: &str, instruction: &str, depends_on: &[u32]) -> Value {
    json!({
        "capability": capability,
        "instruction": instruction,
        "depends_on": depends_on,
    })
}

/// Planner response with ids assigned by position
pub fn plan(steps: Vec<Value>) -> Value {
    let steps: Vec<Value> = steps
        .into_iter()
        .enumerate()
        .map(|(i, mut step)| {
            step["id"] = json!(i + 1);
            step
        })
        .collect();
    json!({ "steps": steps })
}

/// Research response echoing the perspective it was asked about
pub fn research_reply(request: &GenerationRequest) -> Result<Value, CapabilityError> {
    let perspective = request.context["perspective"].as_str().unwrap_or_default().to_string();
    let slug = perspective.replace(' ', "-");
    Ok(json!({
        "report": format!("Findings on {}", perspective),
        "sources": [
            {"title": "Shared overview", "url": "https://example.com/overview"},
            {"title": perspective, "url": format!("https://example.com/{}", slug)},
        ],
        "image_candidates": [],
        "confidence": 0.8,
    }))
}
