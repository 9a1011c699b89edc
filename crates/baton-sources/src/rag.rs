use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use baton_core::{
    BatonError, ChatMessage, MessageContent, ModelDescriptor, Principal, Result, Role,
};
use baton_config::RetrievalConfig;
use baton_llm::BoundLlm;

use crate::resolver::ResolvedSources;

/// Retrieval requests in flight at once, gateway-wide.
const RETRIEVAL_CONCURRENCY: usize = 10;
/// Retrieval queries issued per chat turn.
const MAX_QUERIES: usize = 5;

/// One retrieval hit.
#[derive(Debug, Clone, PartialEq)]
pub struct RagResult {
    pub content: String,
    pub key: String,
    pub locations: Value,
    pub indexes: Value,
    pub char_index: i64,
    pub rag_id: String,
    pub score: f64,
}

impl RagResult {
    /// Rows come back positional:
    /// `[content, key, locations, indexes, charIndex, user, tokenCount, ragId, score]`.
    fn from_row(row: &Value) -> Option<Self> {
        let row = row.as_array()?;
        Some(Self {
            content: row.first()?.as_str()?.to_string(),
            key: row.get(1)?.as_str().unwrap_or_default().to_string(),
            locations: row.get(2).cloned().unwrap_or(Value::Null),
            indexes: row.get(3).cloned().unwrap_or(Value::Null),
            char_index: row.get(4).and_then(Value::as_i64).unwrap_or(0),
            rag_id: row.get(7).and_then(Value::as_str).unwrap_or_default().to_string(),
            score: row.get(8).and_then(Value::as_f64).unwrap_or(0.0),
        })
    }
}

/// Schema for the FAQ query-generation sub-call.
fn question_schema() -> Value {
    json!({
        "type": "object",
        "required": ["questions"],
        "properties": {
            "questions": {
                "type": "array",
                "items": {"type": "string"},
                "minItems": 4,
                "maxItems": 4,
            },
        },
    })
}

/// Build the retrieval query set: the user's last message verbatim, plus —
/// outside filter mode — four FAQ-style questions generated by a single
/// JSON-constrained call on the cheapest equivalent model.
pub async fn generate_queries(
    llm: &BoundLlm,
    last_user_message: &str,
    filter_mode: bool,
) -> Vec<String> {
    let mut queries = vec![last_user_message.to_string()];
    if filter_mode {
        return queries;
    }
    let generator = match &llm.cheapest {
        Some(cheapest) => llm.with_model(cheapest.clone()),
        None => llm.clone(),
    };
    let instruction = format!(
        "Write four FAQ-style questions a user might ask to find documents relevant to this \
         message:\n{last_user_message}"
    );
    match generator.prompt_for_json(&instruction, &question_schema()).await {
        Ok(value) => {
            if let Some(questions) = value["questions"].as_array() {
                queries.extend(
                    questions
                        .iter()
                        .filter_map(|q| q.as_str())
                        .take(MAX_QUERIES - 1)
                        .map(String::from),
                );
            }
        }
        Err(e) => {
            // Retrieval still runs on the verbatim query alone.
            warn!(error = %e, "FAQ query generation failed");
        }
    }
    queries.truncate(MAX_QUERIES);
    queries
}

/// Client for the embedding retrieval service.
#[derive(Clone)]
pub struct RagClient {
    http: reqwest::Client,
    config: RetrievalConfig,
    semaphore: Arc<Semaphore>,
}

impl RagClient {
    pub fn new(config: RetrievalConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            semaphore: Arc::new(Semaphore::new(RETRIEVAL_CONCURRENCY)),
        }
    }

    /// Issue every query in parallel (bounded), then merge, dedupe, and sort
    /// the result set.
    pub async fn retrieve(
        &self,
        principal: &Principal,
        sources: &ResolvedSources,
        queries: &[String],
    ) -> Result<Vec<RagResult>> {
        let futures: Vec<_> = queries
            .iter()
            .map(|query| self.retrieve_one(principal, sources, query.clone()))
            .collect();
        let batches = futures::future::join_all(futures).await;

        let mut all = Vec::new();
        for batch in batches {
            match batch {
                Ok(results) => all.push(results),
                Err(e) => warn!(error = %e, "retrieval query failed"),
            }
        }
        Ok(merge_results(all))
    }

    async fn retrieve_one(
        &self,
        principal: &Principal,
        sources: &ResolvedSources,
        query: String,
    ) -> Result<Vec<RagResult>> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| BatonError::Cancelled)?;

        let body = json!({
            "dataSources": sources.texts.iter().map(|s| &s.id).collect::<Vec<_>>(),
            "groupDataSources": sources.group.iter().map(|s| &s.id).collect::<Vec<_>>(),
            "astDataSources": sources.ast.iter().map(|s| &s.id).collect::<Vec<_>>(),
            "userInput": query,
            "limit": self.config.result_limit,
        });
        let url = format!("{}/embedding-dual-retrieval", self.config.api_base_url);
        debug!(%url, "issuing retrieval query");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&principal.access_token)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| BatonError::Internal(format!("retrieval request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(BatonError::Internal(format!(
                "retrieval returned {}",
                resp.status()
            )));
        }
        let data: Value = resp
            .json()
            .await
            .map_err(|e| BatonError::Internal(format!("bad retrieval payload: {e}")))?;
        Ok(parse_results(&data))
    }
}

pub fn parse_results(payload: &Value) -> Vec<RagResult> {
    payload["result"]
        .as_array()
        .map(|rows| rows.iter().filter_map(RagResult::from_row).collect())
        .unwrap_or_default()
}

/// Merge batches: dedupe by rag id and by exact content, sort by score
/// descending.
pub fn merge_results(batches: Vec<Vec<RagResult>>) -> Vec<RagResult> {
    let mut seen_ids = HashSet::new();
    let mut seen_content = HashSet::new();
    let mut merged = Vec::new();
    for result in batches.into_iter().flatten() {
        if !result.rag_id.is_empty() && !seen_ids.insert(result.rag_id.clone()) {
            continue;
        }
        if !seen_content.insert(result.content.clone()) {
            continue;
        }
        merged.push(result);
    }
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged
}

/// Render the aggregated hits grouped by source key.
pub fn render_context(results: &[RagResult]) -> String {
    let mut keys: Vec<&str> = Vec::new();
    for r in results {
        if !keys.contains(&r.key.as_str()) {
            keys.push(&r.key);
        }
    }
    let mut out = String::from("Relevant excerpts from the attached documents:\n");
    for key in keys {
        out.push_str(&format!("\n--- {key} ---\n"));
        for r in results.iter().filter(|r| r.key == key) {
            out.push_str(&r.content);
            out.push('\n');
        }
    }
    out
}

/// Attach the retrieval context to the conversation. Anthropic models get it
/// prepended to the last user message; other families get a fresh user
/// message inserted just before the last.
pub fn inject_context(messages: &mut Vec<ChatMessage>, context: &str, model: &ModelDescriptor) {
    let Some(last_user_idx) = messages.iter().rposition(|m| m.role == Role::User) else {
        return;
    };
    if model.is_anthropic() {
        let original = messages[last_user_idx].text_content();
        messages[last_user_idx].content =
            MessageContent::Text(format!("{context}\n\n{original}"));
    } else {
        messages.insert(last_user_idx, ChatMessage::user(context.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_core::ProviderKind;

    fn result(rag_id: &str, content: &str, key: &str, score: f64) -> RagResult {
        RagResult {
            content: content.into(),
            key: key.into(),
            locations: Value::Null,
            indexes: Value::Null,
            char_index: 0,
            rag_id: rag_id.into(),
            score,
        }
    }

    fn model(id: &str) -> ModelDescriptor {
        ModelDescriptor {
            id: id.into(),
            provider: ProviderKind::Bedrock,
            context_window: 200_000,
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

    #[test]
    fn test_parse_positional_rows() {
        let payload = json!({
            "result": [
                ["chunk text", "doc.pdf", [1], [0], 120, "u@x.com", 42, "rag-1", 0.92],
            ],
        });
        let results = parse_results(&payload);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "chunk text");
        assert_eq!(results[0].key, "doc.pdf");
        assert_eq!(results[0].rag_id, "rag-1");
        assert!((results[0].score - 0.92).abs() < 1e-9);
    }

    #[test]
    fn test_merge_dedupes_by_id_and_content() {
        let merged = merge_results(vec![
            vec![result("a", "alpha", "d1", 0.5), result("b", "beta", "d1", 0.9)],
            vec![
                result("a", "alpha again", "d1", 0.7), // same rag id
                result("c", "beta", "d2", 0.8),        // same content
                result("d", "delta", "d2", 0.95),
            ],
        ]);
        assert_eq!(merged.len(), 3);
        // Sorted by score descending.
        assert_eq!(merged[0].rag_id, "d");
        assert_eq!(merged[1].rag_id, "b");
        assert_eq!(merged[2].rag_id, "a");
    }

    #[test]
    fn test_render_groups_by_key() {
        let rendered = render_context(&[
            result("a", "first", "doc1.pdf", 0.9),
            result("b", "second", "doc2.pdf", 0.8),
            result("c", "third", "doc1.pdf", 0.7),
        ]);
        let doc1_pos = rendered.find("--- doc1.pdf ---").unwrap();
        let doc2_pos = rendered.find("--- doc2.pdf ---").unwrap();
        assert!(doc1_pos < doc2_pos);
        let doc1_section = &rendered[doc1_pos..doc2_pos];
        assert!(doc1_section.contains("first"));
        assert!(doc1_section.contains("third"));
    }

    #[test]
    fn test_inject_prepends_for_anthropic() {
        let mut messages = vec![ChatMessage::user("what changed?")];
        inject_context(
            &mut messages,
            "CTX",
            &model("us.anthropic.claude-opus-4-6-v1:0"),
        );
        assert_eq!(messages.len(), 1);
        let text = messages[0].text_content();
        assert!(text.starts_with("CTX"));
        assert!(text.ends_with("what changed?"));
    }

    #[test]
    fn test_inject_inserts_for_others() {
        let mut messages = vec![
            ChatMessage::user("earlier"),
            ChatMessage::assistant("sure"),
            ChatMessage::user("what changed?"),
        ];
        inject_context(&mut messages, "CTX", &model("gpt-4o"));
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].text_content(), "CTX");
        assert_eq!(messages[3].text_content(), "what changed?");
    }
}
