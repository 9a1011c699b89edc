use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::ToolDefinition;
use crate::types::RateLimit;

/// Reasoning effort requested from models that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningLevel {
    Low,
    Medium,
    High,
}

impl Default for ReasoningLevel {
    fn default() -> Self {
        ReasoningLevel::Low
    }
}

impl ReasoningLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningLevel::Low => "low",
            ReasoningLevel::Medium => "medium",
            ReasoningLevel::High => "high",
        }
    }
}

/// The `model` object of the inbound request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelChoice {
    #[serde(default)]
    pub id: String,
}

/// Caller-supplied request options. Field names accept both the snake_case
/// canonical form and the camelCase ingress form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default)]
    pub model: ModelChoice,
    #[serde(default, alias = "requestId")]
    pub request_id: Option<String>,
    #[serde(default, alias = "conversationId")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default, alias = "assistantId")]
    pub assistant_id: Option<String>,
    #[serde(default, alias = "accountId")]
    pub account_id: Option<String>,
    #[serde(default, alias = "reasoningLevel")]
    pub reasoning_level: Option<ReasoningLevel>,
    #[serde(default, alias = "enableWebSearch")]
    pub enable_web_search: bool,
    #[serde(default, alias = "dataSourceOptions")]
    pub data_source_options: Option<Value>,
    #[serde(default, alias = "rateLimit")]
    pub rate_limit: Option<RateLimit>,
    #[serde(default, alias = "skipRag")]
    pub skip_rag: bool,
    #[serde(default, alias = "ragOnly")]
    pub rag_only: bool,
    #[serde(default, alias = "mcpClientSide")]
    pub mcp_client_side: bool,
    #[serde(default, alias = "trackConversations")]
    pub track_conversations: bool,
    /// Workflow document executed instead of a plain chat turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<crate::workflow::Workflow>,
}

impl ChatOptions {
    pub fn model_id(&self) -> &str {
        &self.model.id
    }
}

/// Options carried through the orchestration layers into the canonical LLM
/// client. Internal-only fields are stripped before provider dispatch.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub tools: Vec<ToolDefinition>,
    /// "auto", "none", or a specific tool name.
    pub tool_choice: Option<String>,
    pub reasoning_level: Option<ReasoningLevel>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,

    // Internal-only from here down.
    pub conversation_id: Option<String>,
    /// A pre-processor removed messages, making the overflow cache unsafe.
    pub smart_messages_filtered: bool,
    /// Set on RAG extraction and other self-contained utility calls.
    pub skip_historical_context: bool,
    pub is_internal_call: bool,
    /// Overflow recovery already ran once for this request.
    pub already_retried: bool,
    /// The caller keeps streaming after this call returns.
    pub keep_stream_open: bool,
    pub skip_rag: bool,
}

impl CallOptions {
    /// Options for an internal utility call (RAG query generation, overflow
    /// extraction): no tools, no historical context, never recursed into.
    pub fn internal() -> Self {
        Self {
            is_internal_call: true,
            skip_historical_context: true,
            skip_rag: true,
            ..Default::default()
        }
    }

    /// Strip internal-only fields down to what providers may see.
    pub fn sanitized(&self) -> ProviderOptions {
        ProviderOptions {
            tools: self.tools.clone(),
            tool_choice: self.tool_choice.clone(),
            reasoning_level: self.reasoning_level,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }
}

/// The subset of options a provider adapter receives.
#[derive(Debug, Clone, Default)]
pub struct ProviderOptions {
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<String>,
    pub reasoning_level: Option<ReasoningLevel>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

impl ProviderOptions {
    pub fn has_tools(&self) -> bool {
        !self.tools.is_empty()
    }

    /// The same options with tools removed — used by the tools-off retry.
    pub fn without_tools(&self) -> Self {
        Self {
            tools: vec![],
            tool_choice: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_case_ingress_aliases() {
        let json = serde_json::json!({
            "model": {"id": "opus-latest"},
            "requestId": "r1",
            "conversationId": "c1",
            "enableWebSearch": true,
            "mcpClientSide": true,
        });
        let opts: ChatOptions = serde_json::from_value(json).unwrap();
        assert_eq!(opts.model_id(), "opus-latest");
        assert_eq!(opts.request_id.as_deref(), Some("r1"));
        assert_eq!(opts.conversation_id.as_deref(), Some("c1"));
        assert!(opts.enable_web_search);
        assert!(opts.mcp_client_side);
    }

    #[test]
    fn test_sanitized_strips_internal_fields() {
        let opts = CallOptions {
            conversation_id: Some("c1".into()),
            smart_messages_filtered: true,
            is_internal_call: true,
            keep_stream_open: true,
            max_tokens: Some(512),
            ..Default::default()
        };
        let provider = opts.sanitized();
        assert_eq!(provider.max_tokens, Some(512));
        // ProviderOptions has no internal fields by construction; this is the
        // single choke point where they disappear.
        assert!(!provider.has_tools());
    }

    #[test]
    fn test_without_tools_clears_choice() {
        let opts = ProviderOptions {
            tools: vec![ToolDefinition {
                name: "web_search".into(),
                description: "search".into(),
                parameters: serde_json::json!({}),
            }],
            tool_choice: Some("auto".into()),
            ..Default::default()
        };
        let stripped = opts.without_tools();
        assert!(!stripped.has_tools());
        assert!(stripped.tool_choice.is_none());
    }
}
