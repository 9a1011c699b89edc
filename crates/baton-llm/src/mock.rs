use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use baton_core::{
    AssistantReply, BatonError, ChatMessage, ModelDescriptor, ProviderKind, ProviderOptions,
    Result, ToolCall,
};
use baton_providers::Provider;
use baton_stream::DeltaWriter;

/// One scripted provider outcome.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Reply {
        text: String,
        tool_calls: Vec<ToolCall>,
    },
    Error(String),
}

impl MockOutcome {
    pub fn text(text: impl Into<String>) -> Self {
        MockOutcome::Reply {
            text: text.into(),
            tool_calls: vec![],
        }
    }

    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        MockOutcome::Reply {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: format!("call_{name}"),
                name: name.to_string(),
                arguments,
            }],
        }
    }
}

/// What a mock call observed.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub messages: Vec<ChatMessage>,
    pub had_tools: bool,
    pub model_id: String,
}

/// Scripted provider for tests: pops one outcome per call and records what
/// it was asked. An empty script answers "ok".
pub struct MockProvider {
    kind: ProviderKind,
    script: Mutex<VecDeque<MockOutcome>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn scripted(kind: ProviderKind, outcomes: Vec<MockOutcome>) -> Self {
        Self {
            kind,
            script: Mutex::new(outcomes.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, outcome: MockOutcome) {
        self.script.lock().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn stream(
        &self,
        model: &ModelDescriptor,
        messages: &[ChatMessage],
        options: &ProviderOptions,
        writer: &dyn DeltaWriter,
    ) -> Result<AssistantReply> {
        self.calls.lock().push(MockCall {
            messages: messages.to_vec(),
            had_tools: options.has_tools(),
            model_id: model.id.clone(),
        });
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(MockOutcome::text("ok"));
        match outcome {
            MockOutcome::Reply { text, tool_calls } => {
                if !text.is_empty() {
                    writer.text(&text).await?;
                }
                Ok(AssistantReply {
                    content: text,
                    tool_calls,
                    input_tokens: 10,
                    output_tokens: 5,
                })
            }
            MockOutcome::Error(message) => Err(BatonError::Provider {
                provider: self.kind.to_string(),
                message,
            }),
        }
    }
}
