//! Coordinator: entry gate of every invocation.
//!
//! Decides whether the latest request needs a production plan or can be
//! answered directly. Never fails the run: a broken capability call ends
//! the turn with an apology instead.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::adapters::{
    emit_quietly, parse_output, GenerationCapability, GenerationRequest, OutputSchema,
    ProgressEmitter, TitleStore,
};
use crate::domain::{
    EventType, Message, ProductType, ProgressEvent, Role, RunState, RunStatus, StatePatch,
};

use super::error::EngineError;
use super::graph::{Node, NodeId, RouteDecision};
use super::retry::call_with_retry;
use super::safety::SafetyLimits;

/// Scratch key the engine stores the caller's namespace under
pub const NAMESPACE_KEY: &str = "namespace";

const TITLE_CHARS: usize = 60;
const HISTORY_MESSAGES: usize = 20;

const APOLOGY: &str =
    "Sorry, I could not process that request right now. Please try again in a moment.";

const DEFAULT_REPLY: &str =
    "Could you tell me a bit more about what you would like me to make?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Decision {
    HandoffToPlanner,
    ReplyToUser,
}

#[derive(Debug, Deserialize)]
struct CoordinatorDecision {
    decision: Decision,
    #[serde(default)]
    message: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    product_type: Option<ProductType>,
}

/// Title derived from the first user message when the capability gives none
fn fallback_title(state: &RunState) -> String {
    let first = state
        .messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.trim())
        .unwrap_or_default();
    let line = first.lines().next().unwrap_or_default();

    if line.chars().count() > TITLE_CHARS {
        let cut: String = line.chars().take(TITLE_CHARS).collect();
        format!("{}…", cut.trim_end())
    } else if line.is_empty() {
        "Untitled".to_string()
    } else {
        line.to_string()
    }
}

pub struct Coordinator {
    capability: Arc<dyn GenerationCapability>,
    title_store: Option<Arc<dyn TitleStore>>,
    default_product_type: ProductType,
    limits: SafetyLimits,
    emitter: Arc<dyn ProgressEmitter>,
}

impl Coordinator {
    pub fn new(
        capability: Arc<dyn GenerationCapability>,
        title_store: Option<Arc<dyn TitleStore>>,
        default_product_type: ProductType,
        limits: SafetyLimits,
        emitter: Arc<dyn ProgressEmitter>,
    ) -> Self {
        Self {
            capability,
            title_store,
            default_product_type,
            limits,
            emitter,
        }
    }

    fn history(state: &RunState) -> serde_json::Value {
        let start = state.messages.len().saturating_sub(HISTORY_MESSAGES);
        let turns: Vec<_> = state.messages[start..]
            .iter()
            .map(|m| json!({"role": m.role, "name": m.name, "content": m.content}))
            .collect();
        json!({
            "messages": turns,
            "product_type": state.product_type,
            "title": state.title,
            "has_plan": !state.plan.is_empty(),
        })
    }

    async fn persist_title(&self, state: &RunState, title: &str) {
        let Some(store) = &self.title_store else {
            return;
        };
        let namespace = state
            .scratch
            .get(NAMESPACE_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or("default");

        if let Err(e) = store.save_title(namespace, &state.thread_id, title).await {
            warn!(error = %e, "Failed to persist thread title");
        }
    }
}

#[async_trait]
impl Node for Coordinator {
    fn id(&self) -> NodeId {
        NodeId::Coordinator
    }

    #[instrument(skip_all, fields(thread = %state.thread_id))]
    async fn run(&self, state: &RunState) -> Result<RouteDecision, EngineError> {
        let context = Self::history(state);
        let instruction = state
            .last_user_message()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let attempted = call_with_retry(
            &self.limits.retry,
            self.limits.max_retries,
            self.limits.step_timeout(),
            "coordinator",
            || {
                let request = GenerationRequest::new(
                    NodeId::Coordinator.as_str(),
                    OutputSchema::CoordinatorDecision,
                    instruction.clone(),
                )
                .with_context(context.clone());
                let capability = Arc::clone(&self.capability);
                async move { parse_output::<CoordinatorDecision>(capability.generate(request).await?) }
            },
        )
        .await;

        let decision = match attempted.result {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "Coordinator could not decide, replying with an apology");
                return Ok(RouteDecision::end(
                    StatePatch::new()
                        .message(Message::assistant(NodeId::Coordinator.as_str(), APOLOGY))
                        .status(RunStatus::Replied),
                ));
            }
        };

        match decision.decision {
            Decision::ReplyToUser => {
                info!("Replying without a plan");
                let reply = if decision.message.trim().is_empty() {
                    DEFAULT_REPLY.to_string()
                } else {
                    decision.message
                };
                Ok(RouteDecision::end(
                    StatePatch::new()
                        .message(Message::assistant(NodeId::Coordinator.as_str(), reply))
                        .status(RunStatus::Replied),
                ))
            }
            Decision::HandoffToPlanner => {
                let product_type = state
                    .product_type
                    .or(decision.product_type)
                    .unwrap_or(self.default_product_type);

                let acknowledgement = if decision.message.trim().is_empty() {
                    "Understood. Planning the work now.".to_string()
                } else {
                    decision.message
                };

                emit_quietly(
                    self.emitter.as_ref(),
                    ProgressEvent::new(
                        &state.thread_id,
                        NodeId::Coordinator.as_str(),
                        EventType::PartialText,
                        &acknowledgement,
                    ),
                );

                let mut patch = StatePatch::new()
                    .message(Message::assistant(NodeId::Coordinator.as_str(), acknowledgement));
                patch.product_type = Some(product_type);

                if state.title.is_none() {
                    let title = decision
                        .title
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| fallback_title(state));
                    self.persist_title(state, &title).await;
                    patch.title = Some(title);
                }

                info!(product_type = %product_type, "Handing off to planner");
                Ok(RouteDecision::goto(NodeId::Planner, patch))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{CapabilityError, NoopEmitter};

    /// Answers every call with the same value
    struct Fixed(serde_json::Value);

    #[async_trait]
    impl GenerationCapability for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<serde_json::Value, CapabilityError> {
            Ok(self.0.clone())
        }
    }

    fn coordinator(response: serde_json::Value) -> Coordinator {
        Coordinator::new(
            Arc::new(Fixed(response)),
            None,
            ProductType::Slide,
            SafetyLimits::default(),
            Arc::new(NoopEmitter),
        )
    }

    #[tokio::test]
    async fn test_empty_reply_falls_back_to_default_text() {
        let mut state = RunState::new("t");
        state.messages.push(Message::user("hmm"));

        let decision = coordinator(json!({"decision": "reply_to_user", "message": "  "}))
            .run(&state)
            .await
            .unwrap();
        state.apply(decision.patch).unwrap();

        let reply = state.last_assistant_message().unwrap();
        assert_eq!(reply.content, DEFAULT_REPLY);
        assert_eq!(state.status, RunStatus::Replied);
    }

    #[test]
    fn test_fallback_title_truncates() {
        let mut state = RunState::new("t");
        state.messages.push(Message::user("a".repeat(100)));
        let title = fallback_title(&state);
        assert_eq!(title.chars().count(), TITLE_CHARS + 1);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn test_fallback_title_uses_first_line() {
        let mut state = RunState::new("t");
        state.messages.push(Message::user("EV market deck\nwith ten slides"));
        assert_eq!(fallback_title(&state), "EV market deck");
    }

    #[test]
    fn test_decision_parsing() {
        let decision: CoordinatorDecision = serde_json::from_value(json!({
            "decision": "handoff_to_planner",
            "message": "On it",
            "product_type": "comic"
        }))
        .unwrap();
        assert_eq!(decision.decision, Decision::HandoffToPlanner);
        assert_eq!(decision.product_type, Some(ProductType::Comic));

        let bad = serde_json::from_value::<CoordinatorDecision>(json!({"decision": "maybe"}));
        assert!(bad.is_err());
    }
}
