use serde_json::Value;
use tracing::warn;

use baton_core::{BatonError, CallOptions, ChatMessage, Result};
use baton_stream::Collector;

use crate::client::BoundLlm;

/// Pull the first JSON object or array out of a model reply, tolerating
/// code fences and prose around it.
fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }
    let without_fence = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    if let Ok(v) = serde_json::from_str::<Value>(without_fence) {
        return Some(v);
    }
    let start = without_fence.find(['{', '['])?;
    let end = without_fence.rfind(['}', ']'])?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&without_fence[start..=end]).ok()
}

/// Shallow schema check: the top-level type matches and every `required`
/// property is present.
fn matches_schema(value: &Value, schema: &Value) -> bool {
    if let Some(ty) = schema.get("type").and_then(Value::as_str) {
        let ok = match ty {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            _ => true,
        };
        if !ok {
            return false;
        }
    }
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required {
            let Some(key) = key.as_str() else { continue };
            if value.get(key).is_none() {
                return false;
            }
        }
    }
    true
}

impl BoundLlm {
    /// One-shot utility call returning the raw reply text.
    pub async fn prompt_for_string(&self, system: &str, prompt: &str) -> Result<String> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(prompt)];
        let collector = Collector::silent();
        let reply = self
            .chat(&messages, &CallOptions::internal(), collector.as_ref())
            .await?;
        Ok(reply.content.trim().to_string())
    }

    /// Yes/no utility call. Retries once when the reply fails to parse.
    pub async fn prompt_for_boolean(&self, question: &str) -> Result<bool> {
        let system = "Answer the question with exactly one word: true or false.";
        for attempt in 0..2 {
            let text = self.prompt_for_string(system, question).await?;
            let normalized = text.to_lowercase();
            if normalized.contains("true") && !normalized.contains("false") {
                return Ok(true);
            }
            if normalized.contains("false") && !normalized.contains("true") {
                return Ok(false);
            }
            if attempt == 0 {
                warn!("boolean prompt returned {text:?}, retrying");
            }
        }
        Err(BatonError::Internal("unparseable boolean reply".into()))
    }

    /// Pick one of `choices`. Retries once on an unrecognized reply.
    pub async fn prompt_for_choice(&self, question: &str, choices: &[&str]) -> Result<String> {
        let system = format!(
            "Answer with exactly one of the following options and nothing else: {}",
            choices.join(", ")
        );
        for attempt in 0..2 {
            let text = self.prompt_for_string(&system, question).await?;
            let normalized = text.to_lowercase();
            if let Some(hit) = choices
                .iter()
                .find(|c| normalized.contains(&c.to_lowercase()))
            {
                return Ok(hit.to_string());
            }
            if attempt == 0 {
                warn!("choice prompt returned {text:?}, retrying");
            }
        }
        Err(BatonError::Internal("unparseable choice reply".into()))
    }

    /// JSON-constrained utility call, validated shallowly against `schema`.
    /// The single retry drops any attached tools, matching the tools-off
    /// retry of the base call.
    pub async fn prompt_for_json(&self, instruction: &str, schema: &Value) -> Result<Value> {
        let system = format!(
            "Respond with a single JSON value matching this JSON Schema, with no prose and no \
             code fences:\n{schema}"
        );
        let mut options = CallOptions::internal();
        for attempt in 0..2 {
            let messages = vec![
                ChatMessage::system(system.clone()),
                ChatMessage::user(instruction.to_string()),
            ];
            let collector = Collector::silent();
            let reply = self.chat(&messages, &options, collector.as_ref()).await?;
            if let Some(value) = extract_json(&reply.content)
                && matches_schema(&value, schema)
            {
                return Ok(value);
            }
            if attempt == 0 {
                warn!("json prompt failed to parse, retrying without tools");
                options.tools.clear();
                options.tool_choice = None;
            }
        }
        Err(BatonError::Internal("unparseable json reply".into()))
    }
}
