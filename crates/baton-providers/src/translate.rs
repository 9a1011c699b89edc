use serde_json::{Value, json};

use baton_core::{ChatMessage, ContentPart, MessageContent, ModelDescriptor, Role};

/// Notice prepended when image parts are stripped for a text-only model.
const IMAGES_REMOVED_NOTICE: &str =
    "[Image attachments were removed: the selected model does not accept image input.]";

/// Normalize a conversation against a model's capabilities:
/// - system roles are flattened to user messages when unsupported;
/// - the model's `system_prompt_suffix` is concatenated onto the system
///   prompt (or added as one);
/// - image parts are stripped with a textual notice when unsupported.
pub fn normalize_for_model(messages: &[ChatMessage], model: &ModelDescriptor) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len() + 1);

    for msg in messages {
        let mut msg = msg.clone();

        if !model.supports_images && msg.content.has_images() {
            let text = msg.content.text();
            msg.content = MessageContent::Text(format!("{IMAGES_REMOVED_NOTICE}\n{text}"));
        }

        if msg.role == Role::System && !model.supports_system_prompts {
            msg.role = Role::User;
        }

        out.push(msg);
    }

    if let Some(suffix) = &model.system_prompt_suffix {
        if !model.supports_system_prompts {
            out.insert(0, ChatMessage::user(suffix.clone()));
        } else {
            match out.iter_mut().find(|m| m.role == Role::System) {
                Some(system) => {
                    let text = system.content.text();
                    system.content = MessageContent::Text(format!("{text}\n{suffix}"));
                }
                None => out.insert(0, ChatMessage::system(suffix.clone())),
            }
        }
    }

    out
}

/// Pull system messages out into a single string, for providers that take
/// the system prompt as a top-level field.
pub fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<ChatMessage>) {
    let mut system_parts = Vec::new();
    let mut rest = Vec::with_capacity(messages.len());
    for msg in messages {
        if msg.role == Role::System {
            system_parts.push(msg.content.text());
        } else {
            rest.push(msg.clone());
        }
    }
    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };
    (system, rest)
}

fn openai_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(s) => json!(s),
        MessageContent::Parts(parts) => {
            let parts: Vec<Value> = parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::ImageUrl { url } => {
                        json!({"type": "image_url", "image_url": {"url": url}})
                    }
                    ContentPart::Image { data, media_type } => json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{media_type};base64,{data}")},
                    }),
                })
                .collect();
            json!(parts)
        }
    }
}

/// Canonical messages in the chat-completions wire shape.
pub fn openai_wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| match msg.role {
            Role::System => json!({"role": "system", "content": openai_content(&msg.content)}),
            Role::User => json!({"role": "user", "content": openai_content(&msg.content)}),
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    json!({"role": "assistant", "content": openai_content(&msg.content)})
                } else {
                    let calls: Vec<Value> = msg
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments.to_string(),
                                },
                            })
                        })
                        .collect();
                    let text = msg.text_content();
                    json!({
                        "role": "assistant",
                        "content": if text.is_empty() { Value::Null } else { json!(text) },
                        "tool_calls": calls,
                    })
                }
            }
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
                "content": msg.text_content(),
            }),
        })
        .collect()
}

/// Canonical messages in the Anthropic messages wire shape. System content
/// must be split out first with [`split_system`].
pub fn anthropic_wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|msg| match msg.role {
            Role::User => json!({"role": "user", "content": anthropic_content(&msg.content)}),
            Role::Assistant => {
                let mut blocks: Vec<Value> = Vec::new();
                let text = msg.text_content();
                if !text.is_empty() {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                for tc in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": tc.arguments,
                    }));
                }
                if blocks.is_empty() {
                    json!({"role": "assistant", "content": ""})
                } else if msg.tool_calls.is_empty() {
                    json!({"role": "assistant", "content": text})
                } else {
                    json!({"role": "assistant", "content": blocks})
                }
            }
            // Tool results ride as user messages with tool_result blocks.
            Role::Tool => json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.text_content(),
                }],
            }),
            Role::System => unreachable!("system filtered above"),
        })
        .collect()
}

fn anthropic_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(s) => json!(s),
        MessageContent::Parts(parts) => {
            let blocks: Vec<Value> = parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::ImageUrl { url } => json!({"type": "text", "text": url}),
                    ContentPart::Image { data, media_type } => json!({
                        "type": "image",
                        "source": {"type": "base64", "media_type": media_type, "data": data},
                    }),
                })
                .collect();
            json!(blocks)
        }
    }
}

/// Canonical messages as Gemini `contents`, plus the system instruction.
pub fn gemini_contents(messages: &[ChatMessage]) -> (Option<Value>, Vec<Value>) {
    let (system, rest) = split_system(messages);
    let system_instruction = system.map(|s| json!({"parts": [{"text": s}]}));

    let contents = rest
        .iter()
        .map(|msg| match msg.role {
            Role::User => json!({"role": "user", "parts": gemini_parts(&msg.content)}),
            Role::Assistant => {
                let mut parts: Vec<Value> = Vec::new();
                let text = msg.text_content();
                if !text.is_empty() {
                    parts.push(json!({"text": text}));
                }
                for tc in &msg.tool_calls {
                    parts.push(json!({
                        "functionCall": {"name": tc.name, "args": tc.arguments},
                    }));
                }
                json!({"role": "model", "parts": parts})
            }
            Role::Tool => json!({
                "role": "user",
                "parts": [{
                    "functionResponse": {
                        "name": msg.name.clone().unwrap_or_default(),
                        "response": {"content": msg.text_content()},
                    },
                }],
            }),
            Role::System => unreachable!("system filtered above"),
        })
        .collect();

    (system_instruction, contents)
}

fn gemini_parts(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(s) => json!([{"text": s}]),
        MessageContent::Parts(parts) => {
            let parts: Vec<Value> = parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => json!({"text": text}),
                    ContentPart::ImageUrl { url } => json!({"text": url}),
                    ContentPart::Image { data, media_type } => json!({
                        "inlineData": {"mimeType": media_type, "data": data},
                    }),
                })
                .collect();
            json!(parts)
        }
    }
}
