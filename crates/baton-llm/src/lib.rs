//! # baton-llm
//!
//! The canonical LLM client. One call site wraps provider dispatch, the
//! tools-off retry, proactive and reactive context-overflow recovery with a
//! per-conversation extraction cache, and internal-option stripping. Typed
//! prompt variants (`prompt_for_string` / `boolean` / `choice` / `json`)
//! ride on top for utility sub-calls.

pub mod client;
pub mod mock;
pub mod recovery;
pub mod typed;

pub use client::{BoundLlm, LlmClient};
pub use mock::{MockCall, MockOutcome, MockProvider};
pub use recovery::{
    CONTEXT_PREFIX, OverflowCache, OverflowEntry, PROACTIVE_MIN_MESSAGES, plan_extraction,
    proactive_messages,
};
