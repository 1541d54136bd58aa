//! Artifact envelopes produced by workers.
//!
//! Every worker result is wrapped in an envelope before it goes into the
//! run's artifact map. Artifact and product types are closed sets: an
//! unknown value is rejected when the envelope is built.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::plan::ProductType;

/// Normalized wrapper around a worker's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEnvelope {
    /// Artifact key (`step_<id>_<kind>`)
    pub artifact_id: String,

    /// Type of artifact
    pub artifact_type: ArtifactType,

    /// Name of the node that produced it
    pub producer: String,

    /// Product the run is building
    pub product_type: ProductType,

    /// Structured payload
    pub content: serde_json::Value,

    /// When the artifact was created
    pub created_at: DateTime<Utc>,
}

impl ArtifactEnvelope {
    /// Create an envelope for a step result
    pub fn new(
        step_id: u32,
        artifact_type: ArtifactType,
        producer: impl Into<String>,
        product_type: ProductType,
        content: serde_json::Value,
    ) -> Self {
        Self {
            artifact_id: artifact_key(step_id, artifact_type),
            artifact_type,
            producer: producer.into(),
            product_type,
            content,
            created_at: Utc::now(),
        }
    }

    /// Create an envelope from untyped values (e.g. a capability response).
    ///
    /// Unknown artifact or product types are rejected, never coerced.
    pub fn from_raw(
        step_id: u32,
        artifact_type: &str,
        producer: impl Into<String>,
        product_type: &str,
        content: serde_json::Value,
    ) -> Result<Self, EnvelopeError> {
        let artifact_type = artifact_type.parse::<ArtifactType>()?;
        let product_type = product_type
            .parse::<ProductType>()
            .map_err(EnvelopeError::UnknownProductType)?;

        Ok(Self::new(step_id, artifact_type, producer, product_type, content))
    }

    /// Whether the payload records a failure
    pub fn is_degraded(&self) -> bool {
        self.content.get("error").is_some()
            || self
                .content
                .get("failed_checks")
                .and_then(|v| v.as_array())
                .map(|a| !a.is_empty())
                .unwrap_or(false)
    }

    /// The `failed_checks` markers in the payload
    pub fn failed_checks(&self) -> Vec<String> {
        self.content
            .get("failed_checks")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Types of artifacts that can be produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// Writer output (outline, script, draft)
    Writing,

    /// Rendered images
    Visual,

    /// Data analysis output
    DataAnalysis,

    /// Aggregated research report
    Research,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Writing => "writing",
            Self::Visual => "visual",
            Self::DataAnalysis => "data_analysis",
            Self::Research => "research",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "writing" => Ok(Self::Writing),
            "visual" => Ok(Self::Visual),
            "data_analysis" => Ok(Self::DataAnalysis),
            "research" => Ok(Self::Research),
            other => Err(EnvelopeError::UnknownArtifactType(other.to_string())),
        }
    }
}

/// Artifact map key for a step result
pub fn artifact_key(step_id: u32, artifact_type: ArtifactType) -> String {
    format!("step_{}_{}", step_id, artifact_type)
}

/// Envelope construction errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("Unknown artifact type: {0}")]
    UnknownArtifactType(String),

    #[error("Unknown product type: {0}")]
    UnknownProductType(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_creation() {
        let envelope = ArtifactEnvelope::new(
            3,
            ArtifactType::Research,
            "research_manager",
            ProductType::Slide,
            json!({"report": "findings"}),
        );

        assert_eq!(envelope.artifact_id, "step_3_research");
        assert!(!envelope.is_degraded());
    }

    #[test]
    fn test_unknown_types_are_rejected() {
        let bad_artifact =
            ArtifactEnvelope::from_raw(1, "poster", "writer", "slide", json!({}));
        assert_eq!(
            bad_artifact.unwrap_err(),
            EnvelopeError::UnknownArtifactType("poster".to_string())
        );

        let bad_product =
            ArtifactEnvelope::from_raw(1, "writing", "writer", "podcast", json!({}));
        assert_eq!(
            bad_product.unwrap_err(),
            EnvelopeError::UnknownProductType("podcast".to_string())
        );

        let ok = ArtifactEnvelope::from_raw(1, "visual", "visualizer", "comic", json!({}));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_deserialize_rejects_unknown_product() {
        let raw = json!({
            "artifact_id": "step_1_writing",
            "artifact_type": "writing",
            "producer": "writer",
            "product_type": "podcast",
            "content": {},
            "created_at": "2026-01-01T00:00:00Z"
        });
        assert!(serde_json::from_value::<ArtifactEnvelope>(raw).is_err());
    }

    #[test]
    fn test_failed_checks() {
        let envelope = ArtifactEnvelope::new(
            2,
            ArtifactType::Visual,
            "visualizer",
            ProductType::Comic,
            json!({"error": "boom", "failed_checks": ["all_images_failed"]}),
        );
        assert!(envelope.is_degraded());
        assert_eq!(envelope.failed_checks(), vec!["all_images_failed"]);
    }
}
