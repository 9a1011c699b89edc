use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use baton_core::{ChatRequest, Result, StreamEvent};
use baton_sources::ResolvedSources;

use crate::strategies::{DefaultStrategy, MapReduceStrategy};
use crate::strategy::{Assistant, StrategyContext, StrategyOutcome};
use crate::workflow::WorkflowStrategy;

/// Text sources at which the router prefers mapReduce over sequential
/// chunk prompts (only when retrieval is bypassed).
const MAP_REDUCE_MIN_SOURCES: usize = 3;

/// The five routable strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Default,
    MapReduce,
    Workflow,
    Agent,
    CodeInterpreter,
    Artifacts,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Default => "default",
            StrategyKind::MapReduce => "mapReduce",
            StrategyKind::Workflow => "workflow",
            StrategyKind::Agent => "agent",
            StrategyKind::CodeInterpreter => "codeInterpreter",
            StrategyKind::Artifacts => "artifacts",
        }
    }
}

/// Pick a strategy from lightweight request signals: a workflow document,
/// feature flags in the data-source options, and the shape of the resolved
/// sources.
pub fn select(request: &ChatRequest, sources: &ResolvedSources) -> StrategyKind {
    if request.options.workflow.is_some() {
        return StrategyKind::Workflow;
    }
    if let Some(flags) = &request.options.data_source_options {
        if flags["agent"].as_bool().unwrap_or(false) {
            return StrategyKind::Agent;
        }
        if flags["codeInterpreter"].as_bool().unwrap_or(false) {
            return StrategyKind::CodeInterpreter;
        }
        if flags["artifacts"].as_bool().unwrap_or(false) {
            return StrategyKind::Artifacts;
        }
        if flags["mapReduce"].as_bool().unwrap_or(false) {
            return StrategyKind::MapReduce;
        }
    }
    if request.options.skip_rag && sources.texts.len() >= MAP_REDUCE_MIN_SOURCES {
        return StrategyKind::MapReduce;
    }
    StrategyKind::Default
}

/// Routes a request to its strategy and reports the routing decision on the
/// stream before dispatching.
pub struct AssistantRouter {
    /// Externally-provided handlers for agent / codeInterpreter / artifacts.
    external: HashMap<StrategyKind, Arc<dyn Assistant>>,
}

impl AssistantRouter {
    pub fn new() -> Self {
        Self {
            external: HashMap::new(),
        }
    }

    /// Register an external handler for one of the delegated strategies.
    pub fn with_external(mut self, kind: StrategyKind, handler: Arc<dyn Assistant>) -> Self {
        self.external.insert(kind, handler);
        self
    }

    pub async fn dispatch(&self, ctx: &StrategyContext<'_>) -> Result<Option<StrategyOutcome>> {
        let started = Instant::now();
        let kind = select(ctx.request, ctx.sources);
        let routing_time_ms = started.elapsed().as_millis() as u64;
        debug!(assistant = kind.name(), routing_time_ms, "routed request");

        let mut patch = serde_json::Map::new();
        patch.insert("assistant".into(), json!(kind.name()));
        patch.insert("routing_time_ms".into(), json!(routing_time_ms));
        ctx.mux.forward(StreamEvent::State(patch)).await?;

        match kind {
            StrategyKind::Default => DefaultStrategy.handle(ctx).await,
            StrategyKind::MapReduce => MapReduceStrategy.handle(ctx).await,
            StrategyKind::Workflow => WorkflowStrategy.handle(ctx).await,
            delegated => match self.external.get(&delegated) {
                Some(handler) => handler.handle(ctx).await,
                None => Ok(Some(StrategyOutcome::error(
                    501,
                    format!("assistant {} is not available", delegated.name()),
                ))),
            },
        }
    }
}

impl Default for AssistantRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_core::{DataSource, Workflow};

    fn request_with_flags(flags: serde_json::Value) -> ChatRequest {
        let mut request = ChatRequest::default();
        request.options.data_source_options = Some(flags);
        request
    }

    #[test]
    fn test_workflow_wins_over_flags() {
        let mut request = request_with_flags(json!({"mapReduce": true}));
        request.options.workflow = Some(Workflow {
            steps: vec![],
            result_key: None,
        });
        assert_eq!(
            select(&request, &ResolvedSources::default()),
            StrategyKind::Workflow
        );
    }

    #[test]
    fn test_feature_flags_route_to_delegated_strategies() {
        for (flag, expected) in [
            ("agent", StrategyKind::Agent),
            ("codeInterpreter", StrategyKind::CodeInterpreter),
            ("artifacts", StrategyKind::Artifacts),
            ("mapReduce", StrategyKind::MapReduce),
        ] {
            let request = request_with_flags(json!({flag: true}));
            assert_eq!(select(&request, &ResolvedSources::default()), expected);
        }
    }

    #[test]
    fn test_many_raw_sources_prefer_map_reduce() {
        let mut request = ChatRequest::default();
        request.options.skip_rag = true;
        let sources = ResolvedSources {
            texts: (0..4)
                .map(|i| DataSource::new(format!("s3://u@x.com/{i}.txt")))
                .collect(),
            ..Default::default()
        };
        assert_eq!(select(&request, &sources), StrategyKind::MapReduce);

        // With retrieval available the default strategy handles them.
        request.options.skip_rag = false;
        assert_eq!(select(&request, &sources), StrategyKind::Default);
    }

    #[test]
    fn test_plain_chat_routes_default() {
        assert_eq!(
            select(&ChatRequest::default(), &ResolvedSources::default()),
            StrategyKind::Default
        );
    }
}
