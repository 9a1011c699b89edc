use once_cell::sync::Lazy;
use regex::Regex;

use baton_core::ProviderKind;

/// What an overflow inspection concluded.
#[derive(Debug, Clone, PartialEq)]
pub struct OverflowInfo {
    pub is_overflow: bool,
    pub provider: ProviderKind,
    /// Tokens the request asked for, when the vendor reports it.
    pub requested: Option<u64>,
    /// The model's window, when the vendor reports it.
    pub limit: Option<u64>,
}

impl OverflowInfo {
    fn no(provider: ProviderKind) -> Self {
        Self {
            is_overflow: false,
            provider,
            requested: None,
            limit: None,
        }
    }
}

static OPENAI_LENGTHS: Lazy<Regex> = Lazy::new(|| {
    // "This model's maximum context length is 128000 tokens. However, your
    //  messages resulted in 131241 tokens."
    Regex::new(r"maximum context length is (\d+).*?(\d+)").expect("static pattern")
});

/// Inspect a provider error message for the vendor's context-overflow
/// signature.
pub fn detect_overflow(provider: ProviderKind, message: &str) -> OverflowInfo {
    match provider {
        ProviderKind::Bedrock => {
            let is_overflow = message.contains("prompt is too long")
                || message.contains("Input is too long")
                || (message.contains("ValidationException") && message.contains("too long"))
                || message.contains("input length and `max_tokens` exceed context limit");
            OverflowInfo {
                is_overflow,
                provider,
                requested: None,
                limit: None,
            }
        }
        ProviderKind::OpenAi | ProviderKind::Azure => {
            if message.contains("context_length_exceeded")
                || message.contains("maximum context length")
            {
                let (limit, requested) = OPENAI_LENGTHS
                    .captures(message)
                    .map(|c| {
                        (
                            c.get(1).and_then(|m| m.as_str().parse().ok()),
                            c.get(2).and_then(|m| m.as_str().parse().ok()),
                        )
                    })
                    .unwrap_or((None, None));
                OverflowInfo {
                    is_overflow: true,
                    provider,
                    requested,
                    limit,
                }
            } else {
                OverflowInfo::no(provider)
            }
        }
        ProviderKind::Gemini => {
            let is_overflow = message.contains("RESOURCE_EXHAUSTED")
                || message.contains("exceeds the maximum");
            OverflowInfo {
                is_overflow,
                provider,
                requested: None,
                limit: None,
            }
        }
    }
}
