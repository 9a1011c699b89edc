use async_trait::async_trait;
use serde_json::Value;

use baton_core::{AssistantReply, ChatMessage, ModelDescriptor, ProviderKind, ProviderOptions, Result};
use baton_stream::DeltaWriter;

/// A streaming adapter for one upstream vendor family.
///
/// Contract: translate the canonical messages to the vendor wire shape, open
/// a streaming request, forward incremental text through `writer`, and
/// return the terminal assistant reply. Errors before the first byte come
/// back as `Err` with no events written (the caller retries or recovers);
/// errors after streaming began are written as an `Error` event through the
/// writer and also returned as `Err`.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn stream(
        &self,
        model: &ModelDescriptor,
        messages: &[ChatMessage],
        options: &ProviderOptions,
        writer: &dyn DeltaWriter,
    ) -> Result<AssistantReply>;
}

/// Request body with conversation content elided, for critical logs.
pub fn sanitized_body(body: &Value) -> Value {
    let mut body = body.clone();
    if let Some(obj) = body.as_object_mut() {
        for field in ["messages", "input", "contents", "system"] {
            if obj.contains_key(field) {
                obj.insert(field.to_string(), Value::String("<elided>".into()));
            }
        }
    }
    body
}
