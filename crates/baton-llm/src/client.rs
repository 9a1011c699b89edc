use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use baton_core::{
    AssistantReply, BatonError, CallOptions, ChatMessage, ModelDescriptor, Principal, Result,
};
use baton_providers::{Provider, detect_overflow};
use baton_stream::{Collector, DeltaWriter};
use baton_tokens::{CHARS_PER_TOKEN, INTACT_FRACTION};

use crate::recovery::{
    CONTEXT_PREFIX, OverflowCache, OverflowEntry, PROACTIVE_MIN_MESSAGES, plan_extraction,
    proactive_messages,
};

const EXTRACTION_SYSTEM_PROMPT: &str = "You condense earlier conversation history. Produce a \
dense summary of the transcript below that preserves facts, decisions, names, numbers, and \
open questions. Output only the summary text.";

/// The one canonical "call the LLM" implementation. Every strategy, tool
/// round, and workflow step goes through here; it owns the proactive and
/// reactive overflow handling and strips internal options before dispatch.
pub struct LlmClient {
    providers: HashMap<baton_core::ProviderKind, Arc<dyn Provider>>,
    cache: Arc<OverflowCache>,
}

impl LlmClient {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            cache: Arc::new(OverflowCache::new(OverflowCache::DEFAULT_CAP)),
        }
    }

    pub fn with_provider(
        mut self,
        kind: baton_core::ProviderKind,
        provider: Arc<dyn Provider>,
    ) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    pub fn cache(&self) -> &Arc<OverflowCache> {
        &self.cache
    }

    /// Run one streaming chat call against `model`.
    ///
    /// `cheapest` is the user's cheapest equivalent model, used for overflow
    /// extraction when the transcript fits it.
    pub async fn chat(
        &self,
        principal: &Principal,
        model: &ModelDescriptor,
        cheapest: Option<&ModelDescriptor>,
        messages: &[ChatMessage],
        options: &CallOptions,
        writer: &dyn DeltaWriter,
    ) -> Result<AssistantReply> {
        let provider = self
            .providers
            .get(&model.provider)
            .ok_or_else(|| BatonError::ModelNotFound(model.id.clone()))?
            .clone();

        // Proactive overflow path. Never for internal sub-calls, never when a
        // pre-processor filtered messages (the cached indices would lie).
        let mut effective: Vec<ChatMessage> = messages.to_vec();
        if let Some(conversation_id) = &options.conversation_id
            && effective.len() >= PROACTIVE_MIN_MESSAGES
            && !options.smart_messages_filtered
            && !options.skip_historical_context
            && !options.is_internal_call
            && let Some(entry) = self.cache.get(&principal.user_id, conversation_id)
            && let Some(rebuilt) = proactive_messages(&effective, &entry, model)
        {
            debug!(
                conversation = %conversation_id,
                tail = rebuilt.len() - 1,
                "proactive overflow cache hit"
            );
            effective = rebuilt;
        }

        match self
            .dispatch(provider.as_ref(), model, &effective, options, writer)
            .await
        {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let info = detect_overflow(model.provider, &e.to_string());
                if !info.is_overflow || options.is_internal_call || options.already_retried {
                    return Err(e);
                }
                warn!(model = %model.id, "context overflow, attempting recovery");
                let reduced = self
                    .recover(principal, model, cheapest, &effective, options)
                    .await?;
                let retry_options = CallOptions {
                    already_retried: true,
                    ..options.clone()
                };
                match self
                    .dispatch(provider.as_ref(), model, &reduced, &retry_options, writer)
                    .await
                {
                    Ok(reply) => Ok(reply),
                    Err(second) => {
                        // One strike only.
                        error!(
                            critical = true,
                            model = %model.id,
                            "overflow recovery failed on retry: {second}"
                        );
                        Err(second)
                    }
                }
            }
        }
    }

    /// Provider dispatch with the tools-off retry: a first-attempt failure
    /// with tools attached gets exactly one retry without them.
    async fn dispatch(
        &self,
        provider: &dyn Provider,
        model: &ModelDescriptor,
        messages: &[ChatMessage],
        options: &CallOptions,
        writer: &dyn DeltaWriter,
    ) -> Result<AssistantReply> {
        let provider_options = options.sanitized();
        match provider
            .stream(model, messages, &provider_options, writer)
            .await
        {
            Ok(reply) => Ok(reply),
            Err(e) if provider_options.has_tools() => {
                if detect_overflow(model.provider, &e.to_string()).is_overflow {
                    return Err(e);
                }
                error!(
                    critical = true,
                    model = %model.id,
                    "streaming attempt with tools failed, retrying without tools: {e}"
                );
                provider
                    .stream(model, messages, &provider_options.without_tools(), writer)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Reactive recovery: extract (or incrementally update) a historical
    /// summary, cache it, and return the reduced prompt.
    async fn recover(
        &self,
        principal: &Principal,
        model: &ModelDescriptor,
        cheapest: Option<&ModelDescriptor>,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> Result<Vec<ChatMessage>> {
        let prior = options
            .conversation_id
            .as_ref()
            .and_then(|cid| self.cache.get(&principal.user_id, cid));

        let plan = plan_extraction(messages, prior.as_ref(), model).ok_or_else(|| {
            BatonError::ContextOverflow {
                provider: model.provider.to_string(),
                requested: None,
                limit: Some(model.context_window as u64),
            }
        })?;

        // Extraction runs on the cheapest equivalent model when the prompt
        // fits it, else on the user's model; an oversized prompt is truncated.
        let extraction_model = match cheapest {
            Some(cheap)
                if plan.transcript.len()
                    <= (cheap.context_window as f64 * INTACT_FRACTION * CHARS_PER_TOKEN) as usize =>
            {
                cheap
            }
            _ => model,
        };
        let max_chars =
            (extraction_model.context_window as f64 * INTACT_FRACTION * CHARS_PER_TOKEN) as usize;
        let mut transcript = plan.transcript.clone();
        if transcript.len() > max_chars {
            let end = (0..=max_chars)
                .rev()
                .find(|i| transcript.is_char_boundary(*i))
                .unwrap_or(0);
            transcript.truncate(end);
        }

        let extraction_messages = vec![
            ChatMessage::system(EXTRACTION_SYSTEM_PROMPT),
            ChatMessage::user(transcript),
        ];
        let collector = Collector::silent();
        let reply = Box::pin(self.chat(
            principal,
            extraction_model,
            None,
            &extraction_messages,
            &CallOptions::internal(),
            collector.as_ref(),
        ))
        .await?;
        let summary = reply.content.trim().to_string();
        if summary.is_empty() {
            return Err(BatonError::Internal("empty overflow extraction".into()));
        }

        if let Some(conversation_id) = &options.conversation_id {
            self.cache.put(
                &principal.user_id,
                conversation_id,
                OverflowEntry {
                    historical_end_index: plan.boundary - 1,
                    extracted_context: summary.clone(),
                    message_count: messages.len(),
                    model_id: model.id.clone(),
                },
            );
        }

        let mut reduced = Vec::with_capacity(messages.len() - plan.boundary + 1);
        reduced.push(ChatMessage::system(format!("{CONTEXT_PREFIX}{summary}")));
        reduced.extend_from_slice(&messages[plan.boundary..]);
        Ok(reduced)
    }
}

impl Default for LlmClient {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-request facade: the canonical client bound to a principal, the
/// resolved model, and the cheapest equivalent for utility sub-calls.
#[derive(Clone)]
pub struct BoundLlm {
    client: Arc<LlmClient>,
    pub principal: Principal,
    pub model: ModelDescriptor,
    pub cheapest: Option<ModelDescriptor>,
}

impl BoundLlm {
    pub fn new(
        client: Arc<LlmClient>,
        principal: Principal,
        model: ModelDescriptor,
        cheapest: Option<ModelDescriptor>,
    ) -> Self {
        Self {
            client,
            principal,
            model,
            cheapest,
        }
    }

    /// The same facade bound to a different model (RAG query generation uses
    /// the cheapest model, workflows may pin steps to specific models).
    pub fn with_model(&self, model: ModelDescriptor) -> Self {
        Self {
            model,
            ..self.clone()
        }
    }

    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &CallOptions,
        writer: &dyn DeltaWriter,
    ) -> Result<AssistantReply> {
        self.client
            .chat(
                &self.principal,
                &self.model,
                self.cheapest.as_ref(),
                messages,
                options,
                writer,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockOutcome, MockProvider};
    use baton_core::ProviderKind;
    use baton_stream::MemorySink;
    use baton_stream::Multiplexer;

    fn model(id: &str, window: usize) -> ModelDescriptor {
        ModelDescriptor {
            id: id.into(),
            provider: ProviderKind::Bedrock,
            context_window: window,
            output_token_limit: 4096,
            supports_images: false,
            supports_system_prompts: true,
            supports_reasoning: false,
            system_prompt_suffix: None,
            image_limit: 10,
            input_rate: 0.0,
            output_rate: 0.0,
        }
    }

    fn principal() -> Principal {
        Principal::new("u@x.com", "tok")
    }

    fn conversation(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("question {i} {}", "x".repeat(300)))
                } else {
                    ChatMessage::assistant(format!("answer {i} {}", "y".repeat(300)))
                }
            })
            .collect()
    }

    fn client_with(provider: Arc<MockProvider>) -> LlmClient {
        LlmClient::new().with_provider(ProviderKind::Bedrock, provider)
    }

    #[tokio::test]
    async fn test_plain_chat_streams_and_returns_reply() {
        let provider = Arc::new(MockProvider::scripted(
            ProviderKind::Bedrock,
            vec![MockOutcome::text("hello there")],
        ));
        let client = client_with(provider.clone());
        let sink = MemorySink::new();
        let mux = Multiplexer::new(sink.clone());
        let source = mux.register("answer");
        let reply = client
            .chat(
                &principal(),
                &model("m", 100_000),
                None,
                &[ChatMessage::user("hello")],
                &CallOptions::default(),
                &source,
            )
            .await
            .unwrap();
        assert_eq!(reply.content, "hello there");
        assert_eq!(sink.deltas_text(), "hello there");
    }

    #[tokio::test]
    async fn test_proactive_cache_hit_rebuilds_prompt() {
        let provider = Arc::new(MockProvider::new(ProviderKind::Bedrock));
        let client = client_with(provider.clone());
        let m = model("m", 100_000);
        client.cache().put(
            "u@x.com",
            "c7",
            OverflowEntry {
                historical_end_index: 34,
                extracted_context: "earlier context".into(),
                message_count: 46,
                model_id: "m".into(),
            },
        );
        let messages = conversation(48);
        let options = CallOptions {
            conversation_id: Some("c7".into()),
            ..Default::default()
        };
        let collector = Collector::silent();
        client
            .chat(&principal(), &m, None, &messages, &options, collector.as_ref())
            .await
            .unwrap();

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        // The provider never sees the full 48-message history.
        assert_eq!(calls[0].messages.len(), 1 + (48 - 35));
        assert!(
            calls[0].messages[0]
                .text_content()
                .starts_with(CONTEXT_PREFIX)
        );
    }

    #[tokio::test]
    async fn test_reactive_overflow_recovers_once() {
        let overflow_msg = "ValidationException: prompt is too long";
        let provider = Arc::new(MockProvider::scripted(
            ProviderKind::Bedrock,
            vec![
                MockOutcome::Error(overflow_msg.into()),
                MockOutcome::text("a compact summary"), // extraction call
                MockOutcome::text("final answer"),
            ],
        ));
        let client = client_with(provider.clone());
        let m = model("m", 2000);
        let messages = conversation(60);
        let options = CallOptions {
            conversation_id: Some("c1".into()),
            ..Default::default()
        };
        let collector = Collector::silent();
        let reply = client
            .chat(&principal(), &m, None, &messages, &options, collector.as_ref())
            .await
            .unwrap();
        assert_eq!(reply.content, "final answer");
        assert_eq!(provider.call_count(), 3);

        // Cache entry was written for the conversation.
        let entry = client.cache().get("u@x.com", "c1").unwrap();
        assert_eq!(entry.extracted_context, "a compact summary");
        assert_eq!(entry.model_id, "m");
        assert_eq!(entry.message_count, 60);

        // The retried call got the reduced prompt.
        let calls = provider.calls();
        let retry = &calls[2];
        assert!(retry.messages[0].text_content().starts_with(CONTEXT_PREFIX));
        assert!(retry.messages.len() < 60);
    }

    #[tokio::test]
    async fn test_second_overflow_is_one_strike() {
        let overflow_msg = "ValidationException: prompt is too long";
        let provider = Arc::new(MockProvider::scripted(
            ProviderKind::Bedrock,
            vec![
                MockOutcome::Error(overflow_msg.into()),
                MockOutcome::text("summary"),
                MockOutcome::Error(overflow_msg.into()),
            ],
        ));
        let client = client_with(provider.clone());
        let m = model("m", 2000);
        let collector = Collector::silent();
        let err = client
            .chat(
                &principal(),
                &m,
                None,
                &conversation(60),
                &CallOptions::default(),
                collector.as_ref(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BatonError::Provider { .. }));
        // At most: first call, extraction, retry — never a third main call.
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_internal_calls_never_recover() {
        let provider = Arc::new(MockProvider::scripted(
            ProviderKind::Bedrock,
            vec![MockOutcome::Error("prompt is too long".into())],
        ));
        let client = client_with(provider.clone());
        let collector = Collector::silent();
        let err = client
            .chat(
                &principal(),
                &model("m", 2000),
                None,
                &conversation(60),
                &CallOptions::internal(),
                collector.as_ref(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BatonError::Provider { .. }));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_tools_off_retry_on_failure() {
        let provider = Arc::new(MockProvider::scripted(
            ProviderKind::Bedrock,
            vec![
                MockOutcome::Error("upstream hiccup".into()),
                MockOutcome::text("recovered"),
            ],
        ));
        let client = client_with(provider.clone());
        let options = CallOptions {
            tools: vec![baton_core::ToolDefinition {
                name: "web_search".into(),
                description: "search".into(),
                parameters: serde_json::json!({}),
            }],
            tool_choice: Some("auto".into()),
            ..Default::default()
        };
        let collector = Collector::silent();
        let reply = client
            .chat(
                &principal(),
                &model("m", 100_000),
                None,
                &[ChatMessage::user("hi")],
                &options,
                collector.as_ref(),
            )
            .await
            .unwrap();
        assert_eq!(reply.content, "recovered");
        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].had_tools);
        assert!(!calls[1].had_tools);
    }

    #[tokio::test]
    async fn test_smart_filtered_skips_proactive_cache() {
        let provider = Arc::new(MockProvider::new(ProviderKind::Bedrock));
        let client = client_with(provider.clone());
        let m = model("m", 100_000);
        client.cache().put(
            "u@x.com",
            "c7",
            OverflowEntry {
                historical_end_index: 10,
                extracted_context: "ctx".into(),
                message_count: 20,
                model_id: "m".into(),
            },
        );
        let options = CallOptions {
            conversation_id: Some("c7".into()),
            smart_messages_filtered: true,
            ..Default::default()
        };
        let collector = Collector::silent();
        client
            .chat(&principal(), &m, None, &conversation(30), &options, collector.as_ref())
            .await
            .unwrap();
        // Full history was sent.
        assert_eq!(provider.calls()[0].messages.len(), 30);
    }
}
