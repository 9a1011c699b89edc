use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use baton_core::{BlobFetcher, CallOptions, ChatRequest, Result};
use baton_llm::BoundLlm;
use baton_sources::{RagClient, ResolvedSources};
use baton_stream::Multiplexer;
use baton_tools::{ToolLoop, ToolSet};

/// Everything a strategy handler receives. One instance per request.
pub struct StrategyContext<'a> {
    pub llm: &'a BoundLlm,
    pub request: &'a ChatRequest,
    pub sources: &'a ResolvedSources,
    pub mux: &'a Arc<Multiplexer>,
    pub fetcher: Option<&'a dyn BlobFetcher>,
    pub rag: Option<&'a RagClient>,
    pub tool_loop: Option<&'a ToolLoop>,
    pub toolset: ToolSet,
    pub kill: &'a (dyn Fn() -> bool + Send + Sync),
    /// Base call options derived from the request (conversation id, model
    /// parameters, skip flags).
    pub base_options: CallOptions,
}

/// A non-streaming terminal outcome (errors, delegations). `None` from a
/// handler means the stream already carries the response.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutcome {
    pub status: u16,
    pub body: Value,
}

impl StrategyOutcome {
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: serde_json::json!({"error": message.into()}),
        }
    }
}

/// Uniform handler signature shared by every assistant strategy.
#[async_trait]
pub trait Assistant: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &StrategyContext<'_>) -> Result<Option<StrategyOutcome>>;
}
