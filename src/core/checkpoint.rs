//! Checkpoint persistence keyed by thread and user namespace.
//!
//! A checkpoint holds the run state plus the route the outer graph takes
//! next, so an interrupted run resumes at the exact step boundary where it
//! stopped. Checkpoints are stored as one JSON document per thread:
//!
//! ```text
//! <root>/<namespace>/<thread>/checkpoint.json
//! <root>/<namespace>/<thread>/meta.json
//! ```

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use crate::adapters::TitleStore;
use crate::domain::RunState;

use super::graph::Route;

/// Identifies one conversation thread of one user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub namespace: String,
    pub thread_id: String,
}

impl CheckpointKey {
    pub fn new(namespace: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            thread_id: thread_id.into(),
        }
    }
}

impl std::fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.thread_id)
    }
}

/// State at an outer step boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub key: CheckpointKey,
    pub state: RunState,

    /// Route the outer graph takes next (`__end__` when the run is finished)
    pub next: Route,

    pub saved_at: DateTime<Utc>,

    /// Outer node executions in the invocation that wrote this checkpoint
    #[serde(default)]
    pub steps_taken: u32,
}

impl Checkpoint {
    pub fn new(key: CheckpointKey, state: RunState, next: Route, steps_taken: u32) -> Self {
        Self {
            key,
            state,
            next,
            saved_at: Utc::now(),
            steps_taken,
        }
    }

    /// Whether the stored run stopped between steps
    pub fn is_resumable(&self) -> bool {
        self.next != Route::End
    }
}

/// Listing entry for a stored thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub title: Option<String>,
    pub status: String,
    pub next: Route,
    pub saved_at: DateTime<Utc>,
    pub steps: usize,
}

impl From<&Checkpoint> for ThreadSummary {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            thread_id: cp.key.thread_id.clone(),
            title: cp.state.title.clone(),
            status: cp.state.status.label().to_string(),
            next: cp.next,
            saved_at: cp.saved_at,
            steps: cp.state.plan.len(),
        }
    }
}

/// Storage backend for checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>>;

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Threads of a namespace, most recently saved first
    async fn list(&self, namespace: &str) -> Result<Vec<ThreadSummary>>;
}

/// JSON files under a root directory
pub struct FileCheckpointStore {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct ThreadMeta {
    title: String,
    updated_at: DateTime<Utc>,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a thread's checkpoint, title and event log
    pub fn thread_dir(&self, namespace: &str, thread_id: &str) -> PathBuf {
        self.root.join(sanitize(namespace)).join(sanitize(thread_id))
    }

    fn checkpoint_path(&self, key: &CheckpointKey) -> PathBuf {
        self.thread_dir(&key.namespace, &key.thread_id)
            .join("checkpoint.json")
    }

    /// Write through a temp file in the same directory, then rename over the target
    async fn write_atomic(path: PathBuf, bytes: Vec<u8>) -> Result<()> {
        tokio::task::spawn_blocking(move || -> Result<()> {
            let dir = path
                .parent()
                .context("Checkpoint path has no parent directory")?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

            let mut tmp = tempfile::NamedTempFile::new_in(dir)
                .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
            tmp.write_all(&bytes).context("Failed to write checkpoint")?;
            tmp.as_file().sync_all().context("Failed to sync checkpoint")?;
            tmp.persist(&path)
                .with_context(|| format!("Failed to persist {}", path.display()))?;
            Ok(())
        })
        .await
        .context("Checkpoint writer task panicked")?
    }
}

/// Keep path components to a safe character set
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>> {
        let path = self.checkpoint_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse checkpoint: {}", path.display()))?;

        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.checkpoint_path(&checkpoint.key);
        let bytes = serde_json::to_vec_pretty(checkpoint).context("Failed to serialize checkpoint")?;

        Self::write_atomic(path, bytes).await?;
        debug!(key = %checkpoint.key, next = %checkpoint.next, "Checkpoint saved");
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<ThreadSummary>> {
        let pattern = self
            .root
            .join(sanitize(namespace))
            .join("*")
            .join("checkpoint.json");
        let pattern = pattern.to_string_lossy().to_string();

        let mut summaries = Vec::new();
        for entry in glob::glob(&pattern).context("Invalid checkpoint glob")? {
            let path = entry.context("Unreadable checkpoint path")?;
            let raw = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
            match serde_json::from_str::<Checkpoint>(&raw) {
                Ok(cp) => summaries.push(ThreadSummary::from(&cp)),
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }

        summaries.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(summaries)
    }
}

#[async_trait]
impl TitleStore for FileCheckpointStore {
    async fn save_title(&self, namespace: &str, thread_id: &str, title: &str) -> Result<()> {
        let path = self.thread_dir(namespace, thread_id).join("meta.json");
        let meta = ThreadMeta {
            title: title.to_string(),
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&meta).context("Failed to serialize thread meta")?;
        Self::write_atomic(path, bytes).await
    }
}

/// In-process store for tests and embedding
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<CheckpointKey, Checkpoint>>,
    titles: RwLock<HashMap<CheckpointKey, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn title(&self, key: &CheckpointKey) -> Option<String> {
        self.titles.read().await.get(key).cloned()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.read().await.get(key).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.key.clone(), checkpoint.clone());
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<ThreadSummary>> {
        let mut summaries: Vec<ThreadSummary> = self
            .checkpoints
            .read()
            .await
            .values()
            .filter(|cp| cp.key.namespace == namespace)
            .map(ThreadSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(summaries)
    }
}

#[async_trait]
impl TitleStore for MemoryCheckpointStore {
    async fn save_title(&self, namespace: &str, thread_id: &str, title: &str) -> Result<()> {
        self.titles
            .write()
            .await
            .insert(CheckpointKey::new(namespace, thread_id), title.to_string());
        Ok(())
    }
}
