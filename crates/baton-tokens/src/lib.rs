//! # baton-tokens
//!
//! Token counting over a fixed BPE vocabulary (cl100k) with a bounded count
//! cache, and the context-window budget math used by overflow recovery.

pub mod budget;
pub mod counter;

pub use budget::{
    CHARS_PER_TOKEN, CHARS_PER_TOKEN_CONSERVATIVE, ContextBudget, HISTORICAL_FRACTION,
    INTACT_FRACTION, estimate_tokens_from_chars, tail_boundary,
};
pub use counter::{TokenCounter, count_message_tokens, count_tokens};
