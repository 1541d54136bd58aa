//! Append-only progress log with file-based persistence.
//!
//! Progress events are stored as newline-delimited JSON (JSONL) next to the
//! thread's checkpoint. The log is for inspection only; execution never
//! reads it back.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::adapters::{EmitError, ProgressEmitter};
use crate::domain::{EventType, ProgressEvent};

/// JSONL event log for one thread
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    /// Open (or prepare) the log at `path`; parent directories are created
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        }
        Ok(Self { path })
    }

    /// Log for a thread directory (`<dir>/events.jsonl`)
    pub fn for_thread_dir(dir: &Path) -> Result<Self> {
        Self::open(dir.join("events.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event under an exclusive lock
    pub fn append(&self, event: &ProgressEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open events file: {}", self.path.display()))?;

        file.lock_exclusive()
            .context("Failed to acquire file lock on events.jsonl")?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        writeln!(file, "{}", json).context("Failed to write event")?;
        file.flush().context("Failed to flush event")?;

        // Lock is released when file is dropped
        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<ProgressEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: ProgressEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<ProgressEvent>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }
}

impl ProgressEmitter for EventLog {
    fn emit(&self, event: &ProgressEvent) -> Result<(), EmitError> {
        self.append(event).map_err(|e| EmitError(format!("{:#}", e)))
    }
}
