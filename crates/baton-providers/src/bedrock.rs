use async_trait::async_trait;
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::ResponseStream;
use serde_json::{Value, json};
use tracing::{debug, error};

use baton_core::{
    AssistantReply, BatonError, ChatMessage, ModelDescriptor, ProviderKind, ProviderOptions,
    ReasoningLevel, Result, ToolCall,
};
use baton_stream::DeltaWriter;

use crate::provider::{Provider, sanitized_body};
use crate::translate::{anthropic_wire_messages, normalize_for_model, split_system};

/// Adapter for Bedrock-hosted models. Anthropic models use the messages
/// body shape; other families (Llama, Titan) go through the direct text
/// shapes. SigV4 signing is handled by the SDK.
pub struct BedrockProvider {
    client: aws_sdk_bedrockruntime::Client,
}

impl BedrockProvider {
    pub async fn new(region: String) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region))
            .load()
            .await;
        Self {
            client: aws_sdk_bedrockruntime::Client::new(&config),
        }
    }

    pub fn from_client(client: aws_sdk_bedrockruntime::Client) -> Self {
        Self { client }
    }

    fn is_anthropic(model: &ModelDescriptor) -> bool {
        model.id.contains("anthropic")
    }

    fn anthropic_body(
        model: &ModelDescriptor,
        messages: &[ChatMessage],
        options: &ProviderOptions,
    ) -> Value {
        let (system, rest) = split_system(messages);
        let mut body = json!({
            "anthropic_version": "bedrock-2023-05-31",
            "max_tokens": options
                .max_tokens
                .map(|m| m.min(model.output_token_limit as u32))
                .unwrap_or(model.output_token_limit as u32),
            "messages": anthropic_wire_messages(&rest),
        });
        if let Some(system) = system {
            body["system"] = json!(system);
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
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!({"type": "auto"});
        } else if model.supports_reasoning {
            let budget = match options.reasoning_level.unwrap_or(ReasoningLevel::Low) {
                ReasoningLevel::Low => 2048,
                ReasoningLevel::Medium => 8192,
                ReasoningLevel::High => 16384,
            };
            body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
        }
        body
    }

    fn direct_body(
        model: &ModelDescriptor,
        messages: &[ChatMessage],
        options: &ProviderOptions,
    ) -> Value {
        // Non-chat bodies take a single flattened prompt.
        let prompt: String = messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    baton_core::Role::System => "system",
                    baton_core::Role::User | baton_core::Role::Tool => "user",
                    baton_core::Role::Assistant => "assistant",
                };
                format!("{role}: {}\n", m.text_content())
            })
            .collect();
        let max = options
            .max_tokens
            .map(|m| m.min(model.output_token_limit as u32))
            .unwrap_or(model.output_token_limit as u32);
        if model.id.contains("llama") || model.id.contains("meta") {
            json!({
                "prompt": prompt,
                "max_gen_len": max,
                "temperature": options.temperature.unwrap_or(0.7),
                "top_p": options.top_p.unwrap_or(0.9),
            })
        } else {
            json!({
                "inputText": prompt,
                "textGenerationConfig": {
                    "maxTokenCount": max,
                    "temperature": options.temperature.unwrap_or(0.7),
                    "topP": options.top_p.unwrap_or(0.9),
                },
            })
        }
    }
}

/// State while accumulating an Anthropic tool_use block.
#[derive(Default)]
struct ToolAccumulator {
    id: String,
    name: String,
    input_json: String,
    active: bool,
}

#[async_trait]
impl Provider for BedrockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Bedrock
    }

    async fn stream(
        &self,
        model: &ModelDescriptor,
        messages: &[ChatMessage],
        options: &ProviderOptions,
        writer: &dyn DeltaWriter,
    ) -> Result<AssistantReply> {
        let messages = normalize_for_model(messages, model);
        let anthropic = Self::is_anthropic(model);
        let body = if anthropic {
            Self::anthropic_body(model, &messages, options)
        } else {
            Self::direct_body(model, &messages, options)
        };
        debug!(model = %model.id, anthropic, "dispatching Bedrock request");

        let resp = self
            .client
            .invoke_model_with_response_stream()
            .model_id(&model.id)
            .content_type("application/json")
            .body(Blob::new(body.to_string()))
            .send()
            .await
            .map_err(|e| {
                let message = e.to_string();
                error!(
                    critical = true,
                    model = %model.id,
                    body = %sanitized_body(&body),
                    "Bedrock request rejected: {message}"
                );
                BatonError::Provider {
                    provider: "bedrock".into(),
                    message,
                }
            })?;

        let mut stream = resp.body;
        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut accumulator = ToolAccumulator::default();
        let mut input_tokens = 0u32;
        let mut output_tokens = 0u32;

        loop {
            let event = match stream.recv().await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    writer.error(502, &e.to_string()).await?;
                    return Err(BatonError::Provider {
                        provider: "bedrock".into(),
                        message: e.to_string(),
                    });
                }
            };
            let ResponseStream::Chunk(part) = event else {
                continue;
            };
            let Some(bytes) = part.bytes() else { continue };
            let Ok(chunk) = serde_json::from_slice::<Value>(bytes.as_ref()) else {
                continue;
            };

            if anthropic {
                match chunk["type"].as_str() {
                    Some("message_start") => {
                        if let Some(it) =
                            chunk["message"]["usage"]["input_tokens"].as_u64()
                        {
                            input_tokens = it as u32;
                        }
                    }
                    Some("content_block_start") => {
                        let block = &chunk["content_block"];
                        if block["type"].as_str() == Some("tool_use") {
                            accumulator = ToolAccumulator {
                                id: block["id"].as_str().unwrap_or_default().to_string(),
                                name: block["name"].as_str().unwrap_or_default().to_string(),
                                input_json: String::new(),
                                active: true,
                            };
                        }
                    }
                    Some("content_block_delta") => match chunk["delta"]["type"].as_str() {
                        Some("text_delta") => {
                            if let Some(text) = chunk["delta"]["text"].as_str() {
                                content.push_str(text);
                                writer.text(text).await?;
                            }
                        }
                        Some("input_json_delta") => {
                            if let Some(partial) = chunk["delta"]["partial_json"].as_str() {
                                accumulator.input_json.push_str(partial);
                            }
                        }
                        _ => {}
                    },
                    Some("content_block_stop") => {
                        if accumulator.active {
                            tool_calls.push(ToolCall {
                                id: std::mem::take(&mut accumulator.id),
                                name: std::mem::take(&mut accumulator.name),
                                arguments: serde_json::from_str(&accumulator.input_json)
                                    .unwrap_or(Value::Null),
                            });
                            accumulator = ToolAccumulator::default();
                        }
                    }
                    Some("message_delta") => {
                        if let Some(ot) = chunk["usage"]["output_tokens"].as_u64() {
                            output_tokens = ot as u32;
                        }
                    }
                    Some("error") => {
                        let msg = chunk["error"]["message"].as_str().unwrap_or("stream error");
                        writer.error(502, msg).await?;
                        return Err(BatonError::Provider {
                            provider: "bedrock".into(),
                            message: msg.to_string(),
                        });
                    }
                    _ => {}
                }
            } else {
                // Direct families report one text field per chunk.
                let text = chunk["generation"]
                    .as_str()
                    .or_else(|| chunk["outputText"].as_str());
                if let Some(text) = text
                    && !text.is_empty()
                {
                    content.push_str(text);
                    writer.text(text).await?;
                }
                if let Some(pt) = chunk["prompt_token_count"].as_u64() {
                    input_tokens = pt as u32;
                }
                if let Some(gt) = chunk["generation_token_count"].as_u64() {
                    output_tokens = gt as u32;
                }
            }
        }

        Ok(AssistantReply {
            content,
            tool_calls,
            input_tokens,
            output_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_core::ToolDefinition;

    fn model(id: &str, reasoning: bool) -> ModelDescriptor {
        ModelDescriptor {
            id: id.into(),
            provider: ProviderKind::Bedrock,
            context_window: 200_000,
            output_token_limit: 8192,
            supports_images: true,
            supports_system_prompts: true,
            supports_reasoning: reasoning,
            system_prompt_suffix: None,
            image_limit: 10,
            input_rate: 0.0,
            output_rate: 0.0,
        }
    }

    #[test]
    fn test_anthropic_body_shape() {
        let m = model("us.anthropic.claude-opus-4-6-v1:0", false);
        let msgs = vec![ChatMessage::system("rules"), ChatMessage::user("hi")];
        let body = BedrockProvider::anthropic_body(&m, &msgs, &Default::default());
        assert_eq!(body["anthropic_version"], "bedrock-2023-05-31");
        assert_eq!(body["system"], "rules");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], 8192);
    }

    #[test]
    fn test_thinking_omitted_with_tools() {
        let m = model("us.anthropic.claude-opus-4-6-v1:0", true);
        let options = ProviderOptions {
            tools: vec![ToolDefinition {
                name: "t".into(),
                description: String::new(),
                parameters: json!({}),
            }],
            ..Default::default()
        };
        let body = BedrockProvider::anthropic_body(&m, &[ChatMessage::user("hi")], &options);
        assert!(body.get("thinking").is_none());
        assert!(body.get("tools").is_some());

        let body =
            BedrockProvider::anthropic_body(&m, &[ChatMessage::user("hi")], &Default::default());
        assert_eq!(body["thinking"]["type"], "enabled");
    }

    #[test]
    fn test_direct_body_llama_vs_titan() {
        let msgs = vec![ChatMessage::user("hi")];
        let llama = BedrockProvider::direct_body(
            &model("meta.llama3-70b-instruct-v1:0", false),
            &msgs,
            &Default::default(),
        );
        assert!(llama.get("prompt").is_some());
        let titan = BedrockProvider::direct_body(
            &model("amazon.titan-text-premier-v1:0", false),
            &msgs,
            &Default::default(),
        );
        assert!(titan.get("inputText").is_some());
    }
}
