use baton_core::ChatMessage;

/// Fraction of the context window kept for the intact message tail.
pub const INTACT_FRACTION: f64 = 0.7;
/// Fraction of the context window available to historical extraction.
pub const HISTORICAL_FRACTION: f64 = 0.3;

/// Average characters per token for normal prose.
pub const CHARS_PER_TOKEN: f64 = 4.0;
/// Conservative ratio applied to oversized single messages.
pub const CHARS_PER_TOKEN_CONSERVATIVE: f64 = 3.5;

/// Context-window budgets for overflow handling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextBudget {
    /// Token budget for the message tail that stays verbatim.
    pub intact: usize,
    /// Token budget for the historical extraction prompt.
    pub historical: usize,
}

impl ContextBudget {
    pub fn for_window(context_window: usize) -> Self {
        Self {
            intact: (context_window as f64 * INTACT_FRACTION) as usize,
            historical: (context_window as f64 * HISTORICAL_FRACTION) as usize,
        }
    }
}

/// Estimated token count from characters. Oversized messages use the
/// conservative ratio so a borderline tail is not declared fitting.
pub fn estimate_tokens_from_chars(chars: usize, oversized: bool) -> usize {
    let ratio = if oversized {
        CHARS_PER_TOKEN_CONSERVATIVE
    } else {
        CHARS_PER_TOKEN
    };
    (chars as f64 / ratio).ceil() as usize
}

/// Largest index such that `messages[boundary..]` fits the intact budget.
/// Walks from the end accumulating estimated sizes; a single message larger
/// than the whole budget still yields a boundary pointing at it (the caller
/// truncates in that case).
pub fn tail_boundary(messages: &[ChatMessage], intact_budget: usize) -> usize {
    let mut used = 0usize;
    let mut boundary = messages.len();
    for (i, msg) in messages.iter().enumerate().rev() {
        let chars = msg.char_len();
        let tokens = estimate_tokens_from_chars(chars, chars > intact_budget * 4);
        if used + tokens > intact_budget && boundary != messages.len() {
            break;
        }
        if used + tokens > intact_budget {
            // Even the last message alone does not fit — keep just it.
            boundary = i;
            break;
        }
        used += tokens;
        boundary = i;
    }
    boundary
}
