use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tracing::{debug, error};

use baton_core::{
    AssistantReply, BatonError, ChatMessage, ModelDescriptor, ProviderKind, ProviderOptions,
    Result, ToolCall,
};
use baton_stream::DeltaWriter;

use crate::provider::{Provider, sanitized_body};
use crate::translate::{gemini_contents, normalize_for_model};

/// Adapter for Gemini's `streamGenerateContent` endpoint (SSE flavor).
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
        }
    }

    fn build_body(
        model: &ModelDescriptor,
        messages: &[ChatMessage],
        options: &ProviderOptions,
    ) -> Value {
        let (system_instruction, contents) = gemini_contents(messages);
        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": options
                    .max_tokens
                    .map(|m| m.min(model.output_token_limit as u32))
                    .unwrap_or(model.output_token_limit as u32),
            },
        });
        if let Some(system) = system_instruction {
            body["systemInstruction"] = system;
        }
        if let Some(t) = options.temperature {
            body["generationConfig"]["temperature"] = json!(t);
        }
        if let Some(p) = options.top_p {
            body["generationConfig"]["topP"] = json!(p);
        }
        if options.has_tools() {
            let declarations: Vec<Value> = options
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{"functionDeclarations": declarations}]);
        }
        body
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn stream(
        &self,
        model: &ModelDescriptor,
        messages: &[ChatMessage],
        options: &ProviderOptions,
        writer: &dyn DeltaWriter,
    ) -> Result<AssistantReply> {
        let messages = normalize_for_model(messages, model);
        let body = Self::build_body(model, &messages, options);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model.id, self.api_key
        );
        debug!(model = %model.id, "dispatching Gemini request");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BatonError::Provider {
                provider: "gemini".into(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            error!(
                critical = true,
                status = %status,
                body = %sanitized_body(&body),
                "Gemini request rejected: {text}"
            );
            return Err(BatonError::Provider {
                provider: "gemini".into(),
                message: format!("HTTP {status}: {text}"),
            });
        }

        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();
        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut input_tokens = 0u32;
        let mut output_tokens = 0u32;

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    writer.error(502, &e.to_string()).await?;
                    return Err(BatonError::Provider {
                        provider: "gemini".into(),
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
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    continue;
                };

                if let Some(parts) = event["candidates"][0]["content"]["parts"].as_array() {
                    for part in parts {
                        if let Some(text) = part["text"].as_str()
                            && !text.is_empty()
                        {
                            content.push_str(text);
                            writer.text(text).await?;
                        }
                        if let Some(call) = part.get("functionCall") {
                            tool_calls.push(ToolCall {
                                id: format!("gemini_call_{}", tool_calls.len()),
                                name: call["name"].as_str().unwrap_or_default().to_string(),
                                arguments: call["args"].clone(),
                            });
                        }
                    }
                }
                if let Some(usage) = event.get("usageMetadata") {
                    if let Some(pt) = usage["promptTokenCount"].as_u64() {
                        input_tokens = pt as u32;
                    }
                    if let Some(ct) = usage["candidatesTokenCount"].as_u64() {
                        output_tokens = ct as u32;
                    }
                }
                if let Some(err) = event.get("error") {
                    let msg = err["message"].as_str().unwrap_or("stream error");
                    writer.error(502, msg).await?;
                    return Err(BatonError::Provider {
                        provider: "gemini".into(),
                        message: msg.to_string(),
                    });
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

    fn model() -> ModelDescriptor {
        ModelDescriptor {
            id: "gemini-2.0-flash".into(),
            provider: ProviderKind::Gemini,
            context_window: 1_000_000,
            output_token_limit: 8192,
            supports_images: true,
            supports_system_prompts: true,
            supports_reasoning: false,
            system_prompt_suffix: None,
            image_limit: 16,
            input_rate: 0.0,
            output_rate: 0.0,
        }
    }

    #[test]
    fn test_body_carries_system_instruction() {
        let msgs = vec![ChatMessage::system("rules"), ChatMessage::user("hi")];
        let body = GeminiProvider::build_body(&model(), &msgs, &Default::default());
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "rules");
        assert_eq!(body["contents"][0]["role"], "user");
    }

    #[test]
    fn test_tools_become_function_declarations() {
        let options = ProviderOptions {
            tools: vec![ToolDefinition {
                name: "web_search".into(),
                description: "search".into(),
                parameters: json!({"type": "object"}),
            }],
            ..Default::default()
        };
        let body = GeminiProvider::build_body(&model(), &[ChatMessage::user("hi")], &options);
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "web_search"
        );
    }
}
