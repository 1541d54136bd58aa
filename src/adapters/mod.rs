//! Adapter interfaces for external systems.
//!
//! The engine treats generation backends, image renderers, blob storage,
//! progress transport and identity resolution as collaborators behind
//! these traits. Reference implementations live in the submodules.

pub mod blob;
pub mod command;
pub mod identity;
pub mod progress;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ProgressEvent;

pub use blob::FileBlobStore;
pub use command::CommandCapability;
pub use identity::HashedIdentity;
pub use progress::{ChannelEmitter, FanoutEmitter, NoopEmitter, TracingEmitter};

/// Output shape a generation call is expected to return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSchema {
    /// `{decision, message, title?, product_type?}`
    CoordinatorDecision,

    /// `{steps: [...]}`
    Plan,

    /// `{execution_summary, ...}`
    WriterOutput,

    /// `{prompts: [...], execution_summary}`
    VisualPlan,

    /// `{execution_summary, ...}`
    DataAnalysis,

    /// `{report, sources, image_candidates, confidence}`
    ResearchResult,
}

/// A rendered instruction plus the schema the result must follow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Node issuing the call (coordinator, planner, writer, ...)
    pub node: String,

    /// Sub-behavior within the node's capability
    pub mode: Option<String>,

    pub schema: OutputSchema,

    /// Rendered instruction text
    pub instruction: String,

    /// Structured context (conversation, prior artifacts, ...)
    #[serde(default)]
    pub context: serde_json::Value,
}

impl GenerationRequest {
    pub fn new(node: impl Into<String>, schema: OutputSchema, instruction: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            mode: None,
            schema,
            instruction: instruction.into(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_mode(mut self, mode: Option<String>) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// Typed failures of an external capability
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("Capability timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Unparseable output: {0}")]
    Parse(String),

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Capability unavailable: {0}")]
    Unavailable(String),
}

impl CapabilityError {
    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Unavailable(_))
    }

    /// Stable marker used in `failed_checks`
    pub fn check_name(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "capability_timeout",
            Self::RateLimited(_) => "rate_limited",
            Self::Parse(_) => "structured_parse_failed",
            Self::Upstream(_) => "capability_failed",
            Self::Unavailable(_) => "capability_unavailable",
        }
    }
}

/// Deserialize a capability response into the expected shape
pub fn parse_output<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, CapabilityError> {
    serde_json::from_value(value).map_err(|e| CapabilityError::Parse(e.to_string()))
}

/// Structured generation backend
#[async_trait]
pub trait GenerationCapability: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Produce a structured result for a request
    async fn generate(&self, request: GenerationRequest) -> Result<serde_json::Value, CapabilityError>;
}

/// Image rendering backend
#[async_trait]
pub trait ImageRenderer: Send + Sync {
    /// Render one prompt into image bytes
    async fn render(&self, prompt: &str) -> Result<Vec<u8>, CapabilityError>;
}

/// Put/get storage for binary outputs
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes and return a URL that resolves back to them
    async fn put(&self, bytes: &[u8], content_type: &str) -> anyhow::Result<String>;

    /// Fetch bytes by URL
    async fn get(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

/// Fire-and-forget progress sink. Must never block.
pub trait ProgressEmitter: Send + Sync {
    fn emit(&self, event: &ProgressEvent) -> Result<(), EmitError>;
}

/// Emission failure (never a run failure)
#[derive(Debug, Error)]
#[error("Progress emission failed: {0}")]
pub struct EmitError(pub String);

/// Emit and swallow failures
pub fn emit_quietly(emitter: &dyn ProgressEmitter, event: ProgressEvent) {
    if let Err(e) = emitter.emit(&event) {
        tracing::debug!(error = %e, event_type = ?event.event_type, "Dropped progress event");
    }
}

/// Opaque credential to user namespace resolution
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> anyhow::Result<String>;
}

/// Persists the human-readable title of a thread
#[async_trait]
pub trait TitleStore: Send + Sync {
    async fn save_title(&self, namespace: &str, thread_id: &str, title: &str) -> anyhow::Result<()>;
}

/// Bound a capability future by the step timeout
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, CapabilityError>
where
    F: std::future::Future<Output = Result<T, CapabilityError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CapabilityError::Timeout {
            seconds: limit.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CapabilityError::Timeout { seconds: 5 }.is_transient());
        assert!(CapabilityError::RateLimited("429".into()).is_transient());
        assert!(CapabilityError::Parse("eof".into()).is_transient());
        assert!(!CapabilityError::Unavailable("no command".into()).is_transient());
    }

    #[test]
    fn test_parse_output_maps_to_parse_error() {
        #[derive(Debug, Deserialize)]
        struct Expected {
            #[allow(dead_code)]
            steps: Vec<String>,
        }

        let result = parse_output::<Expected>(serde_json::json!({"plan": []}));
        assert!(matches!(result, Err(CapabilityError::Parse(_))));
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<(), CapabilityError> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(CapabilityError::Timeout { .. })));
    }
}
