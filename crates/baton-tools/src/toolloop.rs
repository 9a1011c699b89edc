use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use baton_core::{
    AssistantReply, BatonError, CallOptions, ChatMessage, Result, StatusEvent, ToolCall,
};
use baton_llm::BoundLlm;
use baton_stream::{Collector, DeltaWriter, Multiplexer, SourceHandle};

use crate::mcp::{McpExecutor, ToolSet};
use crate::websearch::{SearchExecutor, WEB_SEARCH_TOOL, WebSearchResult};

/// LLM rounds per request, regardless of model behavior.
pub const MAX_TOOL_ITERATIONS: usize = 5;
/// Hits requested per web search.
const SEARCH_RESULT_LIMIT: usize = 5;

/// Result of running the tool loop.
#[derive(Debug)]
pub struct ToolLoopOutcome {
    pub reply: AssistantReply,
    /// Set when client-side MCP dispatch handed the pending calls back to
    /// the caller; the client continues the conversation.
    pub pending_mcp_tool_calls: bool,
}

/// Drives the function-calling loop: call the model with tools attached,
/// execute what it asks for, feed results back, repeat — at most
/// [`MAX_TOOL_ITERATIONS`] times. The final round drops the tools so the
/// model must produce a natural-language answer.
pub struct ToolLoop {
    search: Option<Arc<dyn SearchExecutor>>,
    mcp: Option<Arc<dyn McpExecutor>>,
    max_iterations: usize,
}

impl ToolLoop {
    pub fn new(search: Option<Arc<dyn SearchExecutor>>, mcp: Option<Arc<dyn McpExecutor>>) -> Self {
        Self {
            search,
            mcp,
            max_iterations: MAX_TOOL_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        llm: &BoundLlm,
        mut messages: Vec<ChatMessage>,
        base_options: &CallOptions,
        toolset: &ToolSet,
        mux: &Arc<Multiplexer>,
        answer: &SourceHandle,
        client_side_mcp: bool,
        kill: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<ToolLoopOutcome> {
        let mut last_reply = AssistantReply::default();

        for round in 1..=self.max_iterations {
            if kill() {
                return Err(BatonError::Cancelled);
            }

            let mut options = base_options.clone();
            options.skip_rag = true;
            if round < self.max_iterations {
                options.tools = toolset.definitions.clone();
                options.tool_choice = Some("auto".into());
            } else {
                // Last round: no tools, the model must answer.
                options.tools.clear();
                options.tool_choice = None;
            }

            // Only the first round streams straight to the client; later
            // rounds are buffered and the final answer forwarded explicitly.
            let collector = Collector::silent();
            let reply = if round == 1 {
                llm.chat(&messages, &options, answer).await?
            } else {
                llm.chat(&messages, &options, collector.as_ref()).await?
            };

            if reply.tool_calls.is_empty() {
                if round > 1 && !reply.content.is_empty() {
                    answer.text(&reply.content).await?;
                }
                return Ok(ToolLoopOutcome {
                    reply,
                    pending_mcp_tool_calls: false,
                });
            }
            debug!(round, calls = reply.tool_calls.len(), "model requested tools");

            // Client-side MCP mode: hand the calls back instead of executing.
            if client_side_mcp
                && reply.tool_calls.iter().any(|c| toolset.is_mcp(&c.name))
            {
                let pending: Vec<Value> = reply
                    .tool_calls
                    .iter()
                    .map(|c| {
                        let route = toolset.route(&c.name);
                        json!({
                            "id": c.id,
                            "name": c.name,
                            "arguments": c.arguments,
                            "server": route.map(|(s, _)| s),
                            "tool": route.map(|(_, t)| t),
                        })
                    })
                    .collect();
                mux.state("mcp_tool_calls", json!(pending)).await?;
                return Ok(ToolLoopOutcome {
                    reply,
                    pending_mcp_tool_calls: true,
                });
            }

            messages.push(reply.clone().into_message());
            last_reply = reply.clone();

            let mut round_sources: Vec<Value> = Vec::new();
            for call in &reply.tool_calls {
                if kill() {
                    return Err(BatonError::Cancelled);
                }
                let status_id = format!("tool:{}", call.id);
                mux.status(StatusEvent::running(&status_id, describe_call(call)))
                    .await?;

                let outcome = self.execute(llm, toolset, call, &mut round_sources).await;
                let content = match outcome {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "tool call failed");
                        json!({"is_error": true, "error": e.to_string()}).to_string()
                    }
                };
                messages.push(ChatMessage::tool(call.id.clone(), content));

                mux.status(StatusEvent::done(&status_id, describe_call(call)))
                    .await?;
            }

            if !round_sources.is_empty() {
                mux.state(
                    "sources",
                    json!({"webSearch": {"sources": round_sources}}),
                )
                .await?;
            }
        }

        // The model kept asking for tools on every round; forward what we
        // have so the stream still carries an answer.
        if !last_reply.content.is_empty() {
            answer.text(&last_reply.content).await?;
        }
        Ok(ToolLoopOutcome {
            reply: last_reply,
            pending_mcp_tool_calls: false,
        })
    }

    async fn execute(
        &self,
        llm: &BoundLlm,
        toolset: &ToolSet,
        call: &ToolCall,
        round_sources: &mut Vec<Value>,
    ) -> Result<String> {
        if call.name == WEB_SEARCH_TOOL {
            let Some(search) = &self.search else {
                return Err(BatonError::Tool {
                    tool: call.name.clone(),
                    message: "web search is not configured".into(),
                });
            };
            let query = call.arguments["query"].as_str().unwrap_or_default();
            let result = search.search(query, SEARCH_RESULT_LIMIT).await?;
            round_sources.extend(collect_sources(&result));
            return Ok(result.to_markdown());
        }

        if toolset.is_mcp(&call.name) {
            let Some((server, tool)) = toolset.route(&call.name) else {
                return Err(BatonError::Tool {
                    tool: call.name.clone(),
                    message: "unknown remote tool".into(),
                });
            };
            let Some(mcp) = &self.mcp else {
                return Err(BatonError::Tool {
                    tool: call.name.clone(),
                    message: "remote tools are not configured".into(),
                });
            };
            return mcp
                .call(&llm.principal.user_id, server, tool, &call.arguments)
                .await;
        }

        Err(BatonError::Tool {
            tool: call.name.clone(),
            message: "unknown tool".into(),
        })
    }
}

fn describe_call(call: &ToolCall) -> String {
    if call.name == WEB_SEARCH_TOOL {
        match call.arguments["query"].as_str() {
            Some(query) => format!("Searching the web: {query}"),
            None => "Searching the web".to_string(),
        }
    } else {
        format!("Running {}", call.name)
    }
}

/// Entries for the UI citations panel.
fn collect_sources(result: &WebSearchResult) -> Vec<Value> {
    result
        .results
        .iter()
        .map(|hit| {
            json!({
                "title": hit.title,
                "url": hit.url,
                "description": hit.description,
                "provider": result.provider,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websearch::SearchHit;
    use async_trait::async_trait;
    use baton_core::{ModelDescriptor, Principal, ProviderKind, StreamEvent, ToolDefinition};
    use baton_llm::{LlmClient, MockOutcome, MockProvider};
    use baton_stream::MemorySink;
    use parking_lot::Mutex as PlMutex;

    struct FakeSearch {
        queries: PlMutex<Vec<String>>,
    }

    #[async_trait]
    impl SearchExecutor for FakeSearch {
        async fn search(&self, query: &str, _max: usize) -> Result<WebSearchResult> {
            self.queries.lock().push(query.to_string());
            Ok(WebSearchResult {
                provider: "brave".into(),
                query: query.into(),
                results: vec![SearchHit {
                    title: "Paris forecast".into(),
                    url: "https://weather.example/paris".into(),
                    description: "Cloudy, 18C".into(),
                }],
                answer: None,
            })
        }
    }

    struct FakeMcp;

    #[async_trait]
    impl McpExecutor for FakeMcp {
        async fn call(
            &self,
            _user: &str,
            server: &str,
            tool: &str,
            _args: &Value,
        ) -> Result<String> {
            Ok(format!("{server}/{tool} ran"))
        }
    }

    fn bound(provider: Arc<MockProvider>) -> BoundLlm {
        let client = Arc::new(LlmClient::new().with_provider(ProviderKind::Bedrock, provider));
        BoundLlm::new(
            client,
            Principal::new("u@x.com", "tok"),
            ModelDescriptor {
                id: "m".into(),
                provider: ProviderKind::Bedrock,
                context_window: 100_000,
                output_token_limit: 4096,
                supports_images: false,
                supports_system_prompts: true,
                supports_reasoning: false,
                system_prompt_suffix: None,
                image_limit: 10,
                input_rate: 0.0,
                output_rate: 0.0,
            },
            None,
        )
    }

    fn search_toolset() -> ToolSet {
        let mut set = ToolSet::default();
        set.push_builtin(crate::websearch::web_search_tool());
        set
    }

    fn mcp_toolset() -> ToolSet {
        let mut set = ToolSet::default();
        set.push_mcp(
            "jira",
            ToolDefinition {
                name: "create_issue".into(),
                description: String::new(),
                parameters: json!({"type": "object"}),
            },
        );
        set
    }

    #[tokio::test]
    async fn test_web_search_round_trip() {
        let provider = Arc::new(MockProvider::scripted(
            ProviderKind::Bedrock,
            vec![
                MockOutcome::tool_call("web_search", json!({"query": "Paris weather"})),
                MockOutcome::text("It is cloudy in Paris."),
            ],
        ));
        let llm = bound(provider.clone());
        let search = Arc::new(FakeSearch {
            queries: PlMutex::new(vec![]),
        });
        let sink = MemorySink::new();
        let mux = Multiplexer::new(sink.clone());
        let answer = mux.register("answer");

        let outcome = ToolLoop::new(Some(search.clone()), None)
            .run(
                &llm,
                vec![ChatMessage::user("What's the weather in Paris?")],
                &CallOptions::default(),
                &search_toolset(),
                &mux,
                &answer,
                false,
                &|| false,
            )
            .await
            .unwrap();

        assert!(!outcome.pending_mcp_tool_calls);
        assert_eq!(outcome.reply.content, "It is cloudy in Paris.");
        assert_eq!(search.queries.lock().as_slice(), ["Paris weather"]);

        // Second model call carried the tool result as markdown.
        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        let tool_msg = calls[1]
            .messages
            .iter()
            .find(|m| m.role == baton_core::Role::Tool)
            .unwrap();
        assert!(tool_msg.text_content().contains("Paris forecast"));

        // Citations state event went out.
        let state = sink
            .events()
            .into_iter()
            .find_map(|e| match e {
                StreamEvent::State(patch) => patch.get("sources").cloned(),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            state["webSearch"]["sources"][0]["url"],
            "https://weather.example/paris"
        );
        // Final answer reached the client stream.
        assert_eq!(sink.deltas_text(), "It is cloudy in Paris.");
    }

    #[tokio::test]
    async fn test_loop_bound_holds() {
        // The model asks for tools forever; the loop stops at the cap.
        let outcomes: Vec<MockOutcome> = (0..20)
            .map(|_| MockOutcome::tool_call("web_search", json!({"query": "again"})))
            .collect();
        let provider = Arc::new(MockProvider::scripted(ProviderKind::Bedrock, outcomes));
        let llm = bound(provider.clone());
        let search = Arc::new(FakeSearch {
            queries: PlMutex::new(vec![]),
        });
        let sink = MemorySink::new();
        let mux = Multiplexer::new(sink);
        let answer = mux.register("answer");

        ToolLoop::new(Some(search), None)
            .run(
                &llm,
                vec![ChatMessage::user("go")],
                &CallOptions::default(),
                &search_toolset(),
                &mux,
                &answer,
                false,
                &|| false,
            )
            .await
            .unwrap();
        assert_eq!(provider.call_count(), MAX_TOOL_ITERATIONS);
        // Final round must not offer tools.
        assert!(!provider.calls().last().unwrap().had_tools);
    }

    #[tokio::test]
    async fn test_client_side_mcp_short_circuits() {
        let provider = Arc::new(MockProvider::scripted(
            ProviderKind::Bedrock,
            vec![MockOutcome::tool_call(
                "mcp_jira_create_issue",
                json!({"title": "bug"}),
            )],
        ));
        let llm = bound(provider.clone());
        let sink = MemorySink::new();
        let mux = Multiplexer::new(sink.clone());
        let answer = mux.register("answer");

        let outcome = ToolLoop::new(None, Some(Arc::new(FakeMcp)))
            .run(
                &llm,
                vec![ChatMessage::user("file a bug")],
                &CallOptions::default(),
                &mcp_toolset(),
                &mux,
                &answer,
                true,
                &|| false,
            )
            .await
            .unwrap();

        assert!(outcome.pending_mcp_tool_calls);
        // Only the one model call — the client continues the conversation.
        assert_eq!(provider.call_count(), 1);
        let state = sink
            .events()
            .into_iter()
            .find_map(|e| match e {
                StreamEvent::State(patch) => patch.get("mcp_tool_calls").cloned(),
                _ => None,
            })
            .unwrap();
        assert_eq!(state[0]["server"], "jira");
        assert_eq!(state[0]["tool"], "create_issue");
    }

    #[tokio::test]
    async fn test_server_side_mcp_feeds_result_back() {
        let provider = Arc::new(MockProvider::scripted(
            ProviderKind::Bedrock,
            vec![
                MockOutcome::tool_call("mcp_jira_create_issue", json!({"title": "bug"})),
                MockOutcome::text("Created the issue."),
            ],
        ));
        let llm = bound(provider.clone());
        let sink = MemorySink::new();
        let mux = Multiplexer::new(sink);
        let answer = mux.register("answer");

        let outcome = ToolLoop::new(None, Some(Arc::new(FakeMcp)))
            .run(
                &llm,
                vec![ChatMessage::user("file a bug")],
                &CallOptions::default(),
                &mcp_toolset(),
                &mux,
                &answer,
                false,
                &|| false,
            )
            .await
            .unwrap();
        assert_eq!(outcome.reply.content, "Created the issue.");
        let tool_msg = provider.calls()[1]
            .messages
            .iter()
            .find(|m| m.role == baton_core::Role::Tool)
            .cloned()
            .unwrap();
        assert_eq!(tool_msg.text_content(), "jira/create_issue ran");
    }

    #[tokio::test]
    async fn test_tool_error_fed_back_as_result() {
        struct FailingSearch;
        #[async_trait]
        impl SearchExecutor for FailingSearch {
            async fn search(&self, _q: &str, _m: usize) -> Result<WebSearchResult> {
                Err(BatonError::Tool {
                    tool: WEB_SEARCH_TOOL.into(),
                    message: "all backends down".into(),
                })
            }
        }
        let provider = Arc::new(MockProvider::scripted(
            ProviderKind::Bedrock,
            vec![
                MockOutcome::tool_call("web_search", json!({"query": "x"})),
                MockOutcome::text("Sorry, search is unavailable."),
            ],
        ));
        let llm = bound(provider.clone());
        let sink = MemorySink::new();
        let mux = Multiplexer::new(sink);
        let answer = mux.register("answer");

        ToolLoop::new(Some(Arc::new(FailingSearch)), None)
            .run(
                &llm,
                vec![ChatMessage::user("search")],
                &CallOptions::default(),
                &search_toolset(),
                &mux,
                &answer,
                false,
                &|| false,
            )
            .await
            .unwrap();
        let tool_msg = provider.calls()[1]
            .messages
            .iter()
            .find(|m| m.role == baton_core::Role::Tool)
            .cloned()
            .unwrap();
        let parsed: Value = serde_json::from_str(&tool_msg.text_content()).unwrap();
        assert_eq!(parsed["is_error"], true);
    }

    #[tokio::test]
    async fn test_kill_switch_cancels_between_rounds() {
        let provider = Arc::new(MockProvider::scripted(
            ProviderKind::Bedrock,
            vec![MockOutcome::tool_call("web_search", json!({"query": "x"}))],
        ));
        let llm = bound(provider);
        let sink = MemorySink::new();
        let mux = Multiplexer::new(sink);
        let answer = mux.register("answer");

        let err = ToolLoop::new(None, None)
            .run(
                &llm,
                vec![ChatMessage::user("go")],
                &CallOptions::default(),
                &search_toolset(),
                &mux,
                &answer,
                false,
                &|| true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BatonError::Cancelled));
    }
}
