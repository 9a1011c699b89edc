//! # baton-providers
//!
//! Provider adapters: translate the canonical request to each vendor's wire
//! format, open a streaming connection, and forward incremental output as
//! canonical deltas. Four families are covered — OpenAI, Azure OpenAI (both
//! `chat/completions` and `responses`), Bedrock (Anthropic and direct), and
//! Gemini — plus the shared message translators, image attachment, and the
//! per-vendor context-overflow detectors.

pub mod bedrock;
pub mod gemini;
pub mod images;
pub mod openai;
pub mod overflow;
pub mod provider;
pub mod translate;

pub use bedrock::BedrockProvider;
pub use gemini::GeminiProvider;
pub use images::attach_images;
pub use openai::{OpenAiFamilyProvider, OpenAiFlavor};
pub use overflow::{OverflowInfo, detect_overflow};
pub use provider::{Provider, sanitized_body};
pub use translate::{
    anthropic_wire_messages, gemini_contents, normalize_for_model, openai_wire_messages,
    split_system,
};
