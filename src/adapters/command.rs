//! Subprocess generation backend.
//!
//! Spawns a configured command per call, writes the JSON request to stdin
//! and reads the result from stdout. Generation calls expect a JSON document
//! on stdout; render calls take the raw bytes.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{CapabilityError, GenerationCapability, GenerationRequest, ImageRenderer};

/// Generation and rendering through an external command
pub struct CommandCapability {
    /// Program to run
    program: String,

    /// Arguments passed before the per-call action argument
    args: Vec<String>,
}

impl CommandCapability {
    /// Create a backend for a program with fixed arguments
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the command with an action argument, piping `input` to stdin
    async fn execute_subprocess(&self, action: &str, input: &[u8]) -> Result<Vec<u8>, CapabilityError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(action)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CapabilityError::Unavailable(format!(
                    "failed to spawn '{}' for '{}': {}",
                    self.program, action, e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input)
                .await
                .map_err(|e| CapabilityError::Upstream(format!("failed to write stdin: {}", e)))?;
            // Drop stdin to signal EOF
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CapabilityError::Upstream(format!("failed to wait for '{}': {}", action, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(classify_failure(action, exit_code, &stderr));
        }

        Ok(output.stdout)
    }
}

/// Map a failed exit into a typed error
fn classify_failure(action: &str, exit_code: i32, stderr: &str) -> CapabilityError {
    let lower = stderr.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("quota") {
        CapabilityError::RateLimited(stderr.to_string())
    } else {
        CapabilityError::Upstream(format!(
            "'{}' failed with exit code {}: {}",
            action, exit_code, stderr
        ))
    }
}

#[async_trait]
impl GenerationCapability for CommandCapability {
    fn name(&self) -> &str {
        "command"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<serde_json::Value, CapabilityError> {
        let input = serde_json::to_vec(&request)
            .map_err(|e| CapabilityError::Parse(format!("failed to encode request: {}", e)))?;

        let stdout = self.execute_subprocess("generate", &input).await?;

        serde_json::from_slice(&stdout).map_err(|e| CapabilityError::Parse(e.to_string()))
    }
}

#[async_trait]
impl ImageRenderer for CommandCapability {
    async fn render(&self, prompt: &str) -> Result<Vec<u8>, CapabilityError> {
        let input = serde_json::to_vec(&serde_json::json!({ "prompt": prompt }))
            .map_err(|e| CapabilityError::Parse(format!("failed to encode prompt: {}", e)))?;

        let bytes = self.execute_subprocess("render", &input).await?;
        if bytes.is_empty() {
            return Err(CapabilityError::Upstream("renderer returned no bytes".to_string()));
        }
        Ok(bytes)
    }
}
