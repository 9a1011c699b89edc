use std::collections::VecDeque;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tiktoken_rs::CoreBPE;
use tracing::warn;

use baton_core::ChatMessage;

/// Cache entries live this long.
const CACHE_TTL: Duration = Duration::from_secs(3600);
/// Oldest entries are evicted past this size.
const CACHE_CAP: usize = 10_000;
/// Cache keys use this many leading characters plus the full length.
const KEY_PREFIX_CHARS: usize = 100;

/// Per-message framing overhead in tokens (role markers and separators).
const MESSAGE_OVERHEAD: usize = 4;

static ENCODER: Lazy<CoreBPE> = Lazy::new(|| {
    // cl100k is the common denominator across the supported model families.
    tiktoken_rs::cl100k_base().expect("embedded cl100k vocabulary")
});

struct CacheEntry {
    key: (String, usize),
    count: usize,
    at: Instant,
}

/// Process-global token counter with a bounded, TTL'd count cache.
///
/// Keys are `(first 100 chars, byte length)` — cheap to compute and collision
/// -safe enough for counting purposes.
pub struct TokenCounter {
    cache: Mutex<VecDeque<CacheEntry>>,
}

static COUNTER: Lazy<TokenCounter> = Lazy::new(|| TokenCounter {
    cache: Mutex::new(VecDeque::new()),
});

impl TokenCounter {
    pub fn global() -> &'static TokenCounter {
        &COUNTER
    }

    /// Token count for a single text.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let key = (
            text.chars().take(KEY_PREFIX_CHARS).collect::<String>(),
            text.len(),
        );

        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.iter().find(|e| e.key == key)
                && entry.at.elapsed() < CACHE_TTL
            {
                return entry.count;
            }
        }

        let count = ENCODER.encode_ordinary(text).len();

        let mut cache = self.cache.lock();
        // Expired entries are dropped opportunistically from the front (the
        // deque is in insertion order, so the oldest live there).
        loop {
            let drop_front = match cache.front() {
                Some(front) => front.at.elapsed() >= CACHE_TTL,
                None => false,
            };
            if !drop_front {
                break;
            }
            cache.pop_front();
        }
        if cache.len() >= CACHE_CAP {
            cache.pop_front();
            warn!(cap = CACHE_CAP, "token cache at capacity, evicting oldest");
        }
        cache.push_back(CacheEntry {
            key,
            count,
            at: Instant::now(),
        });
        count
    }

    /// Token count for a whole conversation, including per-message framing
    /// overhead and tool-call payloads.
    pub fn count_messages(&self, messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .map(|m| {
                let mut n = self.count(&m.text_content()) + MESSAGE_OVERHEAD;
                for tc in &m.tool_calls {
                    n += self.count(&tc.arguments.to_string()) + self.count(&tc.name);
                }
                n
            })
            .sum()
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Convenience free functions over the global counter.
pub fn count_tokens(text: &str) -> usize {
    TokenCounter::global().count(text)
}

pub fn count_message_tokens(messages: &[ChatMessage]) -> usize {
    TokenCounter::global().count_messages(messages)
}
