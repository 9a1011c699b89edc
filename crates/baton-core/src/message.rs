use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block within a multi-part message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// Reference to an image by URL (fetched and inlined before dispatch).
    ImageUrl {
        url: String,
    },
    /// Inline base64 image data.
    Image {
        data: String,
        media_type: String,
    },
}

/// Message content — either a plain string or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// All text content joined together; image parts are skipped.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn has_images(&self) -> bool {
        matches!(self, MessageContent::Parts(parts)
            if parts.iter().any(|p| !matches!(p, ContentPart::Text { .. })))
    }
}

/// A request from the model to call a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: Value,
}

/// A tool the model may call, in JSON Schema form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

/// One message in a conversation. Conversations are client-held and replayed
/// with every request, so messages carry no ids or timestamps of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Set on `role: tool` messages — which call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on assistant messages that requested tool calls.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    /// A tool-result message answering `tool_call_id`.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(content.into()),
            name: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: vec![],
        }
    }

    fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            name: None,
            tool_call_id: None,
            tool_calls: vec![],
        }
    }

    pub fn text_content(&self) -> String {
        self.content.text()
    }

    /// Character length used by budget computations — includes tool call
    /// arguments and tool result content.
    pub fn char_len(&self) -> usize {
        let mut chars = self.content.text().len();
        if let MessageContent::Parts(parts) = &self.content {
            for p in parts {
                if let ContentPart::Image { data, .. } = p {
                    chars += data.len().min(1000);
                }
            }
        }
        for tc in &self.tool_calls {
            chars += tc.name.len() + tc.id.len() + tc.arguments.to_string().len();
        }
        chars
    }
}

/// The terminal assistant message returned by a completed LLM call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantReply {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Observed token counts (prompt side is estimated, output side counted
    /// from deltas or reported by the provider).
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl AssistantReply {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Convert back into a conversation message for the next loop round.
    pub fn into_message(self) -> ChatMessage {
        ChatMessage {
            role: Role::Assistant,
            content: MessageContent::Text(self.content),
            name: None,
            tool_call_id: None,
            tool_calls: self.tool_calls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_content_roundtrip() {
        let msg = ChatMessage::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");
        let back: ChatMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.text_content(), "hello");
    }

    #[test]
    fn test_parts_content_deserializes() {
        let json = serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "look at this"},
                {"type": "image_url", "url": "img://u1/pic.png"},
            ],
        });
        let msg: ChatMessage = serde_json::from_value(json).unwrap();
        assert!(msg.content.has_images());
        assert_eq!(msg.text_content(), "look at this");
    }

    #[test]
    fn test_tool_message_shape() {
        let msg = ChatMessage::tool("call_1", "42");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_char_len_counts_tool_calls() {
        let mut msg = ChatMessage::assistant("ok");
        msg.tool_calls.push(ToolCall {
            id: "call_1".into(),
            name: "web_search".into(),
            arguments: serde_json::json!({"query": "weather"}),
        });
        assert!(msg.char_len() > "ok".len());
    }
}
