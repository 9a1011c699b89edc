use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tracing::{debug, error};

use baton_core::{
    AssistantReply, BatonError, ChatMessage, ModelDescriptor, ProviderKind, ProviderOptions,
    ReasoningLevel, Result, ToolCall,
};
use baton_stream::DeltaWriter;

use crate::provider::{Provider, sanitized_body};
use crate::translate::{normalize_for_model, openai_wire_messages};

/// Which OpenAI-family backend this adapter talks to.
#[derive(Debug, Clone)]
pub enum OpenAiFlavor {
    OpenAi,
    Azure { api_version: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Completions,
    Responses,
}

/// Adapter for OpenAI and Azure OpenAI, covering both the `chat/completions`
/// and the `responses` endpoints.
pub struct OpenAiFamilyProvider {
    client: reqwest::Client,
    api_key: String,
    /// OpenAI API base, or the Azure resource endpoint.
    base_url: String,
    flavor: OpenAiFlavor,
    /// Route tool-free requests through the `responses` endpoint.
    prefer_responses: bool,
}

impl OpenAiFamilyProvider {
    pub fn openai(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            flavor: OpenAiFlavor::OpenAi,
            prefer_responses: false,
        }
    }

    pub fn azure(api_key: String, endpoint: String, api_version: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: endpoint,
            flavor: OpenAiFlavor::Azure { api_version },
            prefer_responses: false,
        }
    }

    pub fn with_responses_endpoint(mut self, prefer: bool) -> Self {
        self.prefer_responses = prefer;
        self
    }

    /// The `responses` endpoint must never see function tools.
    fn endpoint(&self, options: &ProviderOptions) -> Endpoint {
        if self.prefer_responses && !options.has_tools() {
            Endpoint::Responses
        } else {
            Endpoint::Completions
        }
    }

    fn url(&self, model: &str, endpoint: Endpoint) -> String {
        match (&self.flavor, endpoint) {
            (OpenAiFlavor::OpenAi, Endpoint::Completions) => {
                format!("{}/chat/completions", self.base_url)
            }
            (OpenAiFlavor::OpenAi, Endpoint::Responses) => format!("{}/responses", self.base_url),
            (OpenAiFlavor::Azure { api_version }, Endpoint::Completions) => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.base_url, model, api_version
            ),
            (OpenAiFlavor::Azure { api_version }, Endpoint::Responses) => format!(
                "{}/openai/responses?api-version={}",
                self.base_url, api_version
            ),
        }
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.flavor {
            OpenAiFlavor::OpenAi => req.bearer_auth(&self.api_key),
            OpenAiFlavor::Azure { .. } => req.header("api-key", &self.api_key),
        }
    }

    fn reasoning_applies(&self, model: &ModelDescriptor, options: &ProviderOptions) -> bool {
        // Reasoning params must never ride alongside custom tools.
        model.supports_reasoning && !options.has_tools()
    }

    fn completions_body(
        &self,
        model: &ModelDescriptor,
        messages: &[ChatMessage],
        options: &ProviderOptions,
    ) -> Value {
        let mut body = json!({
            "model": model.id,
            "messages": openai_wire_messages(messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(max) = options.max_tokens {
            body["max_tokens"] = json!(max.min(model.output_token_limit as u32));
        }
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = options.top_p {
            body["top_p"] = json!(p);
        }
        if options.has_tools() {
            let tools: Vec<Value> = options
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        },
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            if let Some(choice) = &options.tool_choice {
                body["tool_choice"] = json!(choice);
            }
        }
        if self.reasoning_applies(model, options) {
            let level = options.reasoning_level.unwrap_or(ReasoningLevel::Low);
            body["reasoning_effort"] = json!(level.as_str());
        }
        body
    }

    fn responses_body(
        &self,
        model: &ModelDescriptor,
        messages: &[ChatMessage],
        options: &ProviderOptions,
    ) -> Value {
        let input: Vec<Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        baton_core::Role::System => "system",
                        baton_core::Role::User | baton_core::Role::Tool => "user",
                        baton_core::Role::Assistant => "assistant",
                    },
                    "content": m.text_content(),
                })
            })
            .collect();
        let mut body = json!({
            "model": model.id,
            "input": input,
            "stream": true,
        });
        if let Some(max) = options.max_tokens {
            body["max_output_tokens"] = json!(max.min(model.output_token_limit as u32));
        }
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if self.reasoning_applies(model, options) {
            let level = options.reasoning_level.unwrap_or(ReasoningLevel::Low);
            body["reasoning"] = json!({"effort": level.as_str(), "summary": "auto"});
        }
        body
    }
}

/// Partially accumulated tool call, keyed by the wire `index`.
#[derive(Default, Clone)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

fn finish_tool_calls(pending: Vec<PendingToolCall>) -> Vec<ToolCall> {
    pending
        .into_iter()
        .filter(|p| !p.name.is_empty())
        .map(|p| ToolCall {
            id: p.id,
            name: p.name,
            arguments: serde_json::from_str(&p.arguments).unwrap_or(Value::Null),
        })
        .collect()
}

#[async_trait]
impl Provider for OpenAiFamilyProvider {
    fn kind(&self) -> ProviderKind {
        match self.flavor {
            OpenAiFlavor::OpenAi => ProviderKind::OpenAi,
            OpenAiFlavor::Azure { .. } => ProviderKind::Azure,
        }
    }

    async fn stream(
        &self,
        model: &ModelDescriptor,
        messages: &[ChatMessage],
        options: &ProviderOptions,
        writer: &dyn DeltaWriter,
    ) -> Result<AssistantReply> {
        let messages = normalize_for_model(messages, model);
        let endpoint = self.endpoint(options);
        let body = match endpoint {
            Endpoint::Completions => self.completions_body(model, &messages, options),
            Endpoint::Responses => self.responses_body(model, &messages, options),
        };
        let url = self.url(&model.id, endpoint);
        debug!(model = %model.id, ?endpoint, "dispatching OpenAI-family request");

        let resp = self
            .apply_auth(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| BatonError::Provider {
                provider: self.kind().to_string(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            error!(
                critical = true,
                status = %status,
                body = %sanitized_body(&body),
                "OpenAI-family request rejected: {text}"
            );
            return Err(BatonError::Provider {
                provider: self.kind().to_string(),
                message: format!("HTTP {status}: {text}"),
            });
        }

        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();
        let mut content = String::new();
        let mut pending_tools: Vec<PendingToolCall> = Vec::new();
        let mut input_tokens = 0u32;
        let mut output_tokens = 0u32;

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    // Mid-stream transport failure: surface on the stream and
                    // fail the call. The outer multiplexed stream stays open.
                    writer.error(502, &e.to_string()).await?;
                    return Err(BatonError::Provider {
                        provider: self.kind().to_string(),
                        message: e.to_string(),
                    });
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer = buffer[newline + 1..].to_string();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    continue;
                };

                match endpoint {
                    Endpoint::Completions => {
                        if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
                            input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0) as u32;
                            output_tokens =
                                usage["completion_tokens"].as_u64().unwrap_or(0) as u32;
                        }
                        let delta = &event["choices"][0]["delta"];
                        if let Some(text) = delta["content"].as_str()
                            && !text.is_empty()
                        {
                            content.push_str(text);
                            writer.text(text).await?;
                        }
                        if let Some(calls) = delta["tool_calls"].as_array() {
                            for call in calls {
                                let index = call["index"].as_u64().unwrap_or(0) as usize;
                                if pending_tools.len() <= index {
                                    pending_tools.resize(index + 1, PendingToolCall::default());
                                }
                                let slot = &mut pending_tools[index];
                                if let Some(id) = call["id"].as_str() {
                                    slot.id = id.to_string();
                                }
                                if let Some(name) = call["function"]["name"].as_str() {
                                    slot.name.push_str(name);
                                }
                                if let Some(args) = call["function"]["arguments"].as_str() {
                                    slot.arguments.push_str(args);
                                }
                            }
                        }
                    }
                    Endpoint::Responses => match event["type"].as_str() {
                        Some("response.output_text.delta") => {
                            if let Some(text) = event["delta"].as_str() {
                                content.push_str(text);
                                writer.text(text).await?;
                            }
                        }
                        Some("response.completed") => {
                            let usage = &event["response"]["usage"];
                            input_tokens = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
                            output_tokens = usage["output_tokens"].as_u64().unwrap_or(0) as u32;
                        }
                        Some("response.failed") | Some("error") => {
                            let msg = event["response"]["error"]["message"]
                                .as_str()
                                .or_else(|| event["message"].as_str())
                                .unwrap_or("response failed");
                            writer.error(502, msg).await?;
                            return Err(BatonError::Provider {
                                provider: self.kind().to_string(),
                                message: msg.to_string(),
                            });
                        }
                        _ => {}
                    },
                }
            }
        }

        Ok(AssistantReply {
            content,
            tool_calls: finish_tool_calls(pending_tools),
            input_tokens,
            output_tokens,
        })
    }
}
