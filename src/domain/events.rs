//! Progress events emitted while a run executes.
//!
//! Events are notifications for the transport layer and the per-thread
//! event log. They are never read back to drive execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single progress notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// Thread the run belongs to
    pub thread_id: String,

    /// Plan step (if applicable)
    pub step_id: Option<u32>,

    /// Node that emitted the event
    pub node: String,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (NO prompts, NO secrets)
    pub summary: String,

    /// Time taken in milliseconds (for finished runs)
    pub duration_ms: Option<u64>,

    /// Error message if something failed
    pub error: Option<String>,
}

impl ProgressEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        thread_id: impl Into<String>,
        node: impl Into<String>,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            thread_id: thread_id.into(),
            step_id: None,
            node: node.into(),
            event_type,
            summary: summary.into(),
            duration_ms: None,
            error: None,
        }
    }

    /// Attach the step this event is about
    pub fn with_step(mut self, step_id: u32) -> Self {
        self.step_id = Some(step_id);
        self
    }

    /// Attach duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach error information
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// An invocation started
    RunStarted,

    /// A plan step was dispatched
    StepStarted,

    /// Partial text (acknowledgements, replies, thoughts)
    PartialText,

    /// A plan step finished
    StepCompleted,

    /// A step-local failure was absorbed
    StepDegraded,

    /// Research tasks were dispatched to workers
    ResearchDispatched,

    /// Research results were aggregated
    ResearchAggregated,

    /// An invocation reached a terminal route
    RunFinished,

    /// An invocation was stopped by a budget or timeout
    RunAborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ProgressEvent::new(
            "thread-1",
            "supervisor",
            EventType::StepStarted,
            "Dispatching step 1 to writer",
        )
        .with_step(1);

        let json = serde_json::to_string(&event).unwrap();
        let parsed: ProgressEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::StepStarted);
        assert_eq!(parsed.step_id, Some(1));
        assert!(json.contains("\"step_started\""));
    }

    #[test]
    fn test_event_with_error_and_duration() {
        let event = ProgressEvent::new("t", "engine", EventType::RunAborted, "stopped")
            .with_duration(1500)
            .with_error("step budget exhausted");

        assert_eq!(event.duration_ms, Some(1500));
        assert_eq!(event.error.as_deref(), Some("step budget exhausted"));
    }
}
