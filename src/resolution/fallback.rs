//! Optional LLM classifier behind the deterministic cascade
//!
//! Only descriptors produced by the fallback rule are sent to the model, and
//! the model only picks an operation kind (plus optional instruction text).
//! Base and reference selection is re-run deterministically on its answer.

use super::descriptor::{OperationDescriptor, OperationKind, ResolutionRule};
use super::indexer::ImageIndex;
use super::resolver::{ambiguous_request_reason, descriptor_for_kind, Signals};
use crate::llm::provider::{
    CompletionRequest, JsonSchemaDefinition, LlmProvider, Message, ResponseFormat,
};
use crate::observability::metrics::metrics;
use crate::protocol::messages::{Content, ImageTaskRequest};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How many recent chat text snippets the classifier sees
const CONTEXT_TURNS: usize = 6;

const SYSTEM_PROMPT: &str = "You classify image requests for an image assistant. \
Choose exactly one kind: \"generate\" for a brand new image, \"edit\" to change an existing image, \
\"style_transfer\" to restyle an existing image without changing its content, or \"clarify\" when \
the request cannot be carried out without more information. \
Optionally return a short English instruction for the image model, and for \"clarify\" a reason \
addressed to the user. Never choose images; they are selected separately.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    Generate,
    Edit,
    StyleTransfer,
    Clarify,
}

/// Structured reply expected from the model
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClassifierDecision {
    pub kind: ClassifierKind,
    /// Instruction for the image model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    /// Clarification text for the user when kind is clarify
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ClassifierDecision {
    pub fn json_schema() -> Value {
        let schema = schemars::schema_for!(ClassifierDecision);
        serde_json::to_value(schema).expect("Schema should be serializable")
    }

    /// Parse and schema-check a raw model reply
    pub fn parse(content: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(content.trim())
            .map_err(|e| format!("classifier reply is not JSON: {e}"))?;

        let schema = Self::json_schema();
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| format!("Schema compilation error: {e}"))?;
        validator.validate(&value).map_err(|errors| {
            errors
                .map(|e| format!("At '{}': {}", e.instance_path, e))
                .collect::<Vec<_>>()
                .join("; ")
        })?;

        serde_json::from_value(value).map_err(|e| format!("classifier reply rejected: {e}"))
    }
}

pub struct FallbackClassifier {
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: f32,
}

impl FallbackClassifier {
    pub fn new(provider: Arc<dyn LlmProvider>, model: String) -> Self {
        Self {
            provider,
            model,
            temperature: 0.1,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Refine a fallback-rule descriptor. Any other descriptor, and any
    /// classifier failure, returns the input unchanged.
    pub async fn refine(
        &self,
        request: &ImageTaskRequest,
        index: &ImageIndex,
        signals: &Signals,
        descriptor: OperationDescriptor,
    ) -> OperationDescriptor {
        if descriptor.rule != ResolutionRule::Fallback || descriptor.needs_clarification {
            return descriptor;
        }

        let completion = self.build_completion_request(request, index);
        let decision = match self.provider.complete(completion).await {
            Ok(response) => match response.content.as_deref().map(ClassifierDecision::parse) {
                Some(Ok(decision)) => decision,
                Some(Err(e)) => {
                    warn!(request_id = %request.request_id, "Ignoring classifier reply: {}", e);
                    return descriptor;
                }
                None => {
                    warn!(request_id = %request.request_id, "Classifier returned no content");
                    return descriptor;
                }
            },
            Err(e) => {
                warn!(request_id = %request.request_id, "Classifier unavailable: {}", e);
                return descriptor;
            }
        };

        debug!(request_id = %request.request_id, kind = ?decision.kind, "Classifier decision");
        let refined = Self::apply(decision, index, signals);
        metrics().classifier_called(refined.outcome_label() != descriptor.outcome_label());
        info!(
            request_id = %request.request_id,
            from = %descriptor.outcome_label(),
            to = %refined.outcome_label(),
            "Fallback descriptor refined by classifier"
        );
        refined
    }

    /// Re-run the deterministic image policy for the classifier's kind
    pub fn apply(
        decision: ClassifierDecision,
        index: &ImageIndex,
        signals: &Signals,
    ) -> OperationDescriptor {
        let kind = match decision.kind {
            ClassifierKind::Generate => OperationKind::Generate,
            ClassifierKind::Edit => OperationKind::Edit,
            ClassifierKind::StyleTransfer => OperationKind::StyleTransfer,
            ClassifierKind::Clarify => {
                let reason = decision
                    .reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| ambiguous_request_reason(signals.korean));
                return OperationDescriptor::clarify(ResolutionRule::Classifier, reason);
            }
        };

        descriptor_for_kind(
            kind,
            ResolutionRule::Classifier,
            index,
            signals,
            decision.instruction.as_deref(),
        )
    }

    fn build_completion_request(
        &self,
        request: &ImageTaskRequest,
        index: &ImageIndex,
    ) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system(SYSTEM_PROMPT),
                Message::user(Self::build_user_prompt(request, index)),
            ],
            max_tokens: Some(300),
            temperature: Some(self.temperature),
            response_format: Some(ResponseFormat::JsonSchema {
                json_schema: JsonSchemaDefinition {
                    name: "image_task_decision".to_string(),
                    strict: Some(false),
                    schema: ClassifierDecision::json_schema(),
                },
            }),
            metadata: [("request_id".to_string(), request.request_id.clone())]
                .into_iter()
                .collect(),
        }
    }

    fn build_user_prompt(request: &ImageTaskRequest, index: &ImageIndex) -> String {
        let mut prompt = format!("REQUEST:\n{}\n\n", request.prompt.trim());

        if !request.chat_summary.trim().is_empty() {
            prompt.push_str(&format!(
                "CONVERSATION SUMMARY:\n{}\n\n",
                request.chat_summary.trim()
            ));
        }

        let recent: Vec<String> = request
            .chat
            .iter()
            .flat_map(|turn| {
                turn.contents.iter().filter_map(move |content| match content {
                    Content::Text { text } if !text.trim().is_empty() => {
                        Some(format!("{:?}: {}", turn.role, text.trim()))
                    }
                    _ => None,
                })
            })
            .collect();
        if !recent.is_empty() {
            let start = recent.len().saturating_sub(CONTEXT_TURNS);
            prompt.push_str("RECENT MESSAGES (oldest first):\n");
            for line in &recent[start..] {
                prompt.push_str(line);
                prompt.push('\n');
            }
            prompt.push('\n');
        }

        prompt.push_str(&format!(
            "AVAILABLE IMAGES: {} uploaded, {} in chat",
            index.uploads().len(),
            index.chat().len()
        ));
        if let Some(latest_ai) = index.latest_ai() {
            if !latest_ai.description.is_empty() {
                prompt.push_str(&format!(
                    "\nLATEST RESULT: {}",
                    latest_ai.description.trim()
                ));
            }
        }
        prompt
    }
}
