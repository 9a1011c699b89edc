use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;

use baton_core::{ChatMessage, ModelDescriptor};
use baton_tokens::{CHARS_PER_TOKEN, ContextBudget, tail_boundary};

/// Prefix of the synthetic system message carrying recovered history.
pub const CONTEXT_PREFIX: &str = "Previous relevant context: ";

/// Conversations below this length never take the proactive path.
pub const PROACTIVE_MIN_MESSAGES: usize = 20;

/// Cached historical extraction for one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct OverflowEntry {
    /// Last message index covered by the extraction.
    pub historical_end_index: usize,
    pub extracted_context: String,
    /// Conversation length when the entry was written.
    pub message_count: usize,
    /// Context-window equivalence: the entry is only valid for this model.
    pub model_id: String,
}

/// Process-local, LRU-bounded cache keyed by `(user_id, conversation_id)`.
pub struct OverflowCache {
    entries: DashMap<(String, String), OverflowEntry>,
    order: Mutex<VecDeque<(String, String)>>,
    cap: usize,
}

impl OverflowCache {
    pub const DEFAULT_CAP: usize = 1000;

    pub fn new(cap: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            cap,
        }
    }

    pub fn get(&self, user_id: &str, conversation_id: &str) -> Option<OverflowEntry> {
        let key = (user_id.to_string(), conversation_id.to_string());
        let entry = self.entries.get(&key)?.clone();
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|k| k == &key) {
            order.remove(pos);
        }
        order.push_back(key);
        Some(entry)
    }

    pub fn put(&self, user_id: &str, conversation_id: &str, entry: OverflowEntry) {
        let key = (user_id.to_string(), conversation_id.to_string());
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|k| k == &key) {
            order.remove(pos);
        }
        order.push_back(key.clone());
        while order.len() > self.cap {
            if let Some(evicted) = order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
        drop(order);
        self.entries.insert(key, entry);
    }

    pub fn invalidate(&self, user_id: &str, conversation_id: &str) {
        let key = (user_id.to_string(), conversation_id.to_string());
        self.entries.remove(&key);
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|k| k == &key) {
            order.remove(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Proactive path: rebuild the prompt from a cache entry when it is valid
/// for this model and the conversation has only grown since it was written.
///
/// Returns `[system: "Previous relevant context: …", intact tail]`, or None
/// when the entry does not apply.
pub fn proactive_messages(
    messages: &[ChatMessage],
    entry: &OverflowEntry,
    model: &ModelDescriptor,
) -> Option<Vec<ChatMessage>> {
    if entry.model_id != model.id {
        return None;
    }
    if messages.len() < entry.message_count {
        return None;
    }
    let tail_start = entry.historical_end_index + 1;
    if tail_start >= messages.len() {
        return None;
    }
    let mut rebuilt = Vec::with_capacity(messages.len() - tail_start + 1);
    rebuilt.push(ChatMessage::system(format!(
        "{CONTEXT_PREFIX}{}",
        entry.extracted_context
    )));
    rebuilt.extend_from_slice(&messages[tail_start..]);
    Some(rebuilt)
}

/// Plan for one reactive extraction round.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionPlan {
    /// First index of the tail kept verbatim.
    pub boundary: usize,
    /// Transcript (or prior summary + delta) fed to the extraction call,
    /// already capped to the historical budget.
    pub transcript: String,
    /// Whether this updates a prior summary incrementally.
    pub incremental: bool,
}

fn render_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                baton_core::Role::System => "system",
                baton_core::Role::User => "user",
                baton_core::Role::Assistant => "assistant",
                baton_core::Role::Tool => "tool",
            };
            format!("{role}: {}", m.text_content())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Cap a transcript to `max_chars`, keeping the head: the prior-summary
/// header (incremental updates) and the oldest uncovered messages matter
/// most, and the newest messages survive verbatim in the intact tail anyway.
fn cap_transcript(transcript: String, max_chars: usize) -> String {
    if transcript.len() <= max_chars {
        return transcript;
    }
    let end = (0..=max_chars)
        .rev()
        .find(|i| transcript.is_char_boundary(*i))
        .unwrap_or(0);
    transcript[..end].to_string()
}

/// Compute the reactive extraction plan: where to split the conversation and
/// what to feed the extraction call.
pub fn plan_extraction(
    messages: &[ChatMessage],
    prior: Option<&OverflowEntry>,
    model: &ModelDescriptor,
) -> Option<ExtractionPlan> {
    let budget = ContextBudget::for_window(model.context_window);
    let boundary = tail_boundary(messages, budget.intact);
    if boundary == 0 {
        // Nothing historical to extract — the tail alone does not fit.
        return None;
    }
    let max_chars = (budget.historical as f64 * CHARS_PER_TOKEN) as usize;

    match prior {
        Some(entry)
            if entry.model_id == model.id && entry.historical_end_index + 1 < boundary =>
        {
            let delta = render_transcript(&messages[entry.historical_end_index + 1..boundary]);
            let transcript = format!(
                "Prior summary:\n{}\n\nNew messages:\n{}",
                entry.extracted_context, delta
            );
            Some(ExtractionPlan {
                boundary,
                transcript: cap_transcript(transcript, max_chars),
                incremental: true,
            })
        }
        _ => {
            let transcript = render_transcript(&messages[..boundary]);
            Some(ExtractionPlan {
                boundary,
                transcript: cap_transcript(transcript, max_chars),
                incremental: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_core::ProviderKind;

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

    fn conversation(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("question {i} {}", "x".repeat(200)))
                } else {
                    ChatMessage::assistant(format!("answer {i} {}", "y".repeat(200)))
                }
            })
            .collect()
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = OverflowCache::new(2);
        let entry = OverflowEntry {
            historical_end_index: 0,
            extracted_context: "ctx".into(),
            message_count: 1,
            model_id: "m".into(),
        };
        cache.put("u", "c1", entry.clone());
        cache.put("u", "c2", entry.clone());
        cache.put("u", "c3", entry.clone());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("u", "c1").is_none());
        assert!(cache.get("u", "c3").is_some());
    }

    #[test]
    fn test_cache_get_refreshes_recency() {
        let cache = OverflowCache::new(2);
        let entry = OverflowEntry {
            historical_end_index: 0,
            extracted_context: "ctx".into(),
            message_count: 1,
            model_id: "m".into(),
        };
        cache.put("u", "c1", entry.clone());
        cache.put("u", "c2", entry.clone());
        cache.get("u", "c1");
        cache.put("u", "c3", entry);
        // c2 was the least recently used.
        assert!(cache.get("u", "c2").is_none());
        assert!(cache.get("u", "c1").is_some());
    }

    #[test]
    fn test_proactive_splits_at_cached_boundary() {
        let messages = conversation(48);
        let entry = OverflowEntry {
            historical_end_index: 34,
            extracted_context: "earlier discussion of budgets".into(),
            message_count: 46,
            model_id: "m".into(),
        };
        let rebuilt = proactive_messages(&messages, &entry, &model("m", 100_000)).unwrap();
        // System summary + messages[35..48].
        assert_eq!(rebuilt.len(), 1 + (48 - 35));
        assert!(rebuilt[0].text_content().starts_with(CONTEXT_PREFIX));
        assert_eq!(rebuilt[1], messages[35]);
        assert_eq!(rebuilt.last(), messages.last());
    }

    #[test]
    fn test_proactive_rejects_model_change() {
        let messages = conversation(48);
        let entry = OverflowEntry {
            historical_end_index: 34,
            extracted_context: "ctx".into(),
            message_count: 46,
            model_id: "other-model".into(),
        };
        assert!(proactive_messages(&messages, &entry, &model("m", 100_000)).is_none());
    }

    #[test]
    fn test_proactive_rejects_shrunk_conversation() {
        let messages = conversation(40);
        let entry = OverflowEntry {
            historical_end_index: 34,
            extracted_context: "ctx".into(),
            message_count: 46,
            model_id: "m".into(),
        };
        assert!(proactive_messages(&messages, &entry, &model("m", 100_000)).is_none());
    }

    #[test]
    fn test_proactive_is_idempotent() {
        // Same prefix, same entry → identical rebuilt prompt on every run.
        let messages = conversation(48);
        let entry = OverflowEntry {
            historical_end_index: 34,
            extracted_context: "stable summary".into(),
            message_count: 46,
            model_id: "m".into(),
        };
        let a = proactive_messages(&messages, &entry, &model("m", 100_000)).unwrap();
        let b = proactive_messages(&messages, &entry, &model("m", 100_000)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_plan_full_extraction() {
        let messages = conversation(100);
        // Small window forces a split.
        let plan = plan_extraction(&messages, None, &model("m", 2000)).unwrap();
        assert!(plan.boundary > 0);
        assert!(!plan.incremental);
        assert!(plan.transcript.contains("question"));
    }

    #[test]
    fn test_plan_incremental_uses_prior_summary() {
        let messages = conversation(100);
        let prior = OverflowEntry {
            historical_end_index: 10,
            extracted_context: "the prior summary".into(),
            message_count: 60,
            model_id: "m".into(),
        };
        let plan = plan_extraction(&messages, Some(&prior), &model("m", 2000)).unwrap();
        assert!(plan.incremental);
        assert!(plan.transcript.contains("the prior summary"));
        // The delta excludes messages already covered.
        assert!(!plan.transcript.contains("question 0 "));
    }

    #[test]
    fn test_plan_caps_transcript_to_historical_budget() {
        let messages = conversation(400);
        let m = model("m", 2000);
        let plan = plan_extraction(&messages, None, &m).unwrap();
        let budget = ContextBudget::for_window(m.context_window);
        assert!(plan.transcript.len() <= (budget.historical as f64 * CHARS_PER_TOKEN) as usize);
    }
}
