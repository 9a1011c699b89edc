use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use baton_config::BatonConfig;
use baton_core::{
    BatonError, BlobFetcher, CallOptions, ChatRequest, KillSwitch, Principal, Result, StreamEvent,
};
use baton_flow::{AssistantRouter, StrategyContext};
use baton_limits::{BreakerRegistry, RateLimiter};
use baton_llm::{BoundLlm, LlmClient};
use baton_providers::attach_images;
use baton_registry::{AliasRegistry, ModelCatalog};
use baton_sources::{HttpBlobFetcher, RagClient, SourceResolver};
use baton_stream::{EventSink, Multiplexer};
use baton_store::{Item, Tables};
use baton_tokens::count_message_tokens;
use baton_tools::{
    McpExecutor, McpRegistry, SearchExecutor, ToolLoop, ToolSet, WebSearcher, web_search_tool,
};

use crate::metrics::Metrics;
use crate::state::{RequestRegistry, RequestState};

/// Breaker key for the chat path.
const CHAT_FUNCTION: &str = "chat";

/// Everything the gateway needs to admit and run requests. One per process.
pub struct Gateway {
    pub config: BatonConfig,
    pub tables: Tables,
    pub limiter: RateLimiter,
    pub breakers: BreakerRegistry,
    pub aliases: AliasRegistry,
    pub catalog: ModelCatalog,
    pub llm: Arc<LlmClient>,
    pub resolver: SourceResolver,
    pub rag: Option<RagClient>,
    pub search: Option<Arc<WebSearcher>>,
    pub mcp: Arc<McpRegistry>,
    pub router: AssistantRouter,
    pub requests: RequestRegistry,
    pub metrics: Metrics,
}

/// An admitted chat request, ready to stream. Errors before this point map
/// to HTTP status codes; everything after becomes stream events.
#[derive(Debug)]
pub struct PreparedChat {
    pub principal: Principal,
    pub request: ChatRequest,
    pub model: baton_core::ModelDescriptor,
    pub cheapest: Option<baton_core::ModelDescriptor>,
    pub resolved: baton_sources::ResolvedSources,
    pub state: Arc<RequestState>,
    pub request_id: String,
}

impl Gateway {
    /// Handle the kill-switch control shape.
    pub fn control(&self, principal: &Principal, kill: &KillSwitch) -> bool {
        self.metrics.inc_kill_switch();
        self.requests
            .set_kill_switch(&principal.user_id, &kill.request_id, kill.value)
    }

    /// Admission control and resolution, in order: circuit breaker, rate
    /// limiter, alias → model, data-source access, request-state creation.
    pub async fn prepare(
        &self,
        principal: Principal,
        mut request: ChatRequest,
    ) -> Result<PreparedChat> {
        if request.messages.is_empty() {
            return Err(BatonError::InvalidRequest(
                "request carries no messages".into(),
            ));
        }

        self.breakers.check(CHAT_FUNCTION, Some(&principal.user_id))?;

        if let Err(e) = self
            .limiter
            .check(&principal, request.options.rate_limit.as_ref())
            .await
        {
            self.metrics.inc_rate_limit_rejections();
            return Err(e);
        }

        // Aliases resolve exactly once, at entry; concrete ids pass through.
        let resolution = self.aliases.resolve(request.options.model_id());
        if resolution.was_alias {
            debug!(
                alias = %request.options.model.id,
                model = %resolution.resolved_id,
                "resolved model alias"
            );
        }
        request.options.model.id = resolution.resolved_id;

        let models = self.catalog.user_available_models(&principal).await?;
        let model = models.require(request.options.model_id())?.clone();
        let cheapest = {
            let equivalent = models.cheapest_equivalent(&model);
            (equivalent.id != model.id).then(|| equivalent.clone())
        };

        let resolved = self
            .resolver
            .resolve(
                &principal,
                &request.data_sources,
                &request.image_sources,
                request.options.assistant_id.as_deref(),
            )
            .await?;

        let request_id = request
            .options
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let state = self.requests.create(&principal.user_id, &request_id)?;

        Ok(PreparedChat {
            principal,
            request,
            model,
            cheapest,
            resolved,
            state,
            request_id,
        })
    }

    /// Run an admitted request to completion, streaming into `sink`. Always
    /// terminates the stream with `End` or `Error`.
    pub async fn run(self: &Arc<Self>, prepared: PreparedChat, sink: Arc<dyn EventSink>) {
        let PreparedChat {
            principal,
            mut request,
            model,
            cheapest,
            resolved,
            state,
            request_id,
        } = prepared;
        let started = Instant::now();
        self.metrics.inc_chat_streams();

        let counting = Arc::new(CountingSink::new(sink));
        let trace = self
            .config
            .server
            .trace_requests
            .then(|| Arc::new(TraceSink::new(counting.clone())));
        let outer: Arc<dyn EventSink> = match &trace {
            Some(trace) => trace.clone(),
            None => counting.clone(),
        };
        let mux = Multiplexer::new(outer);

        let fetcher = HttpBlobFetcher::new(
            self.config.retrieval.api_base_url.clone(),
            principal.access_token.clone(),
        );

        // Attach inbound images before any provider sees the conversation.
        if !resolved.images.is_empty()
            && let Err(e) =
                attach_images(&mut request.messages, &resolved.images, &fetcher, &model).await
        {
            warn!(error = %e, "image attachment failed");
        }

        let mut toolset = ToolSet::default();
        if request.options.enable_web_search && self.config.search.any_configured() {
            toolset.push_builtin(web_search_tool());
        }
        toolset.merge(self.mcp.user_toolset(&principal.user_id).await);
        let tool_loop = ToolLoop::new(
            self.search
                .clone()
                .map(|s| s as Arc<dyn SearchExecutor>),
            Some(self.mcp.clone() as Arc<dyn McpExecutor>),
        );

        let base_options = CallOptions {
            max_tokens: request.options.max_tokens,
            temperature: request.options.temperature,
            top_p: request.options.top_p,
            reasoning_level: request.options.reasoning_level,
            conversation_id: request.options.conversation_id.clone(),
            skip_rag: request.options.skip_rag,
            ..Default::default()
        };
        let llm = BoundLlm::new(
            self.llm.clone(),
            principal.clone(),
            model.clone(),
            cheapest,
        );

        let kill_state = state.clone();
        let kill = move || kill_state.killed();
        let tokens_in = count_message_tokens(&request.messages) as u64;

        let ctx = StrategyContext {
            llm: &llm,
            request: &request,
            sources: &resolved,
            mux: &mux,
            fetcher: Some(&fetcher),
            rag: self.rag.as_ref(),
            tool_loop: Some(&tool_loop),
            toolset,
            kill: &kill,
            base_options,
        };

        let timeout = Duration::from_secs(self.config.server.request_timeout_secs);
        let outcome = tokio::time::timeout(timeout, self.router.dispatch(&ctx)).await;

        let mut failed = false;
        match outcome {
            Ok(Ok(None)) => {
                let _ = mux.forward(StreamEvent::end()).await;
            }
            Ok(Ok(Some(outcome))) => {
                failed = outcome.status >= 500;
                let _ = mux
                    .forward(StreamEvent::Error {
                        status_code: outcome.status,
                        status_text: outcome.body.to_string(),
                    })
                    .await;
            }
            Ok(Err(BatonError::Cancelled)) => {
                info!(request = %request_id, "request cancelled");
                let _ = mux.forward(StreamEvent::end()).await;
            }
            Ok(Err(e)) => {
                failed = true;
                self.metrics.inc_http_errors();
                warn!(request = %request_id, error = %e, "request failed mid-stream");
                let _ = mux
                    .forward(StreamEvent::Error {
                        status_code: e.status_code(),
                        status_text: e.to_string(),
                    })
                    .await;
            }
            Err(_) => {
                // Dropping the dispatch future closed the in-flight provider
                // streams.
                failed = true;
                error!(
                    critical = true,
                    request = %request_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "request exceeded the routing timeout"
                );
                let _ = mux
                    .forward(StreamEvent::Error {
                        status_code: 408,
                        status_text: format!(
                            "request timed out after {}s",
                            timeout.as_secs()
                        ),
                    })
                    .await;
            }
        }

        // Usage accounting: duration, estimated tokens in, observed tokens
        // out, and the cost charge against the user's tables.
        let tokens_out = (counting.delta_chars() / 4) as u64;
        let cost = tokens_in as f64 * model.input_rate + tokens_out as f64 * model.output_rate;
        self.metrics
            .record_usage(started.elapsed().as_millis() as u64, tokens_in, tokens_out, cost);
        if cost > 0.0
            && let Err(e) = self.tables.add_charge(&principal.user_id, cost).await
        {
            warn!(error = %e, "cost charge failed");
        }
        if failed {
            self.breakers
                .record_failure(CHAT_FUNCTION, Some(&principal.user_id));
        } else {
            self.breakers
                .record_success(CHAT_FUNCTION, Some(&principal.user_id), cost);
        }

        if let Some(trace) = trace {
            let events = trace.events();
            let item = Item::new(
                principal.user_id.clone(),
                request_id.clone(),
                json!({"events": events, "duration_ms": started.elapsed().as_millis() as u64}),
            );
            if let Err(e) = self.tables.store().put("request-traces", item).await {
                warn!(error = %e, "trace persistence failed");
            }
        }

        state.finalize();
        self.requests.remove(&principal.user_id, &request_id);
    }
}

/// Counts streamed delta characters for the tokens-out estimate.
pub struct CountingSink {
    inner: Arc<dyn EventSink>,
    chars: AtomicUsize,
}

impl CountingSink {
    pub fn new(inner: Arc<dyn EventSink>) -> Self {
        Self {
            inner,
            chars: AtomicUsize::new(0),
        }
    }

    pub fn delta_chars(&self) -> usize {
        self.chars.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventSink for CountingSink {
    async fn send(&self, event: StreamEvent) -> Result<()> {
        if let StreamEvent::Delta { payload, .. } = &event
            && let Some(text) = payload.as_text()
        {
            self.chars.fetch_add(text.len(), Ordering::Relaxed);
        }
        self.inner.send(event).await
    }
}

/// Records every stream event for post-request trace persistence.
pub struct TraceSink {
    inner: Arc<dyn EventSink>,
    events: parking_lot::Mutex<Vec<serde_json::Value>>,
}

impl TraceSink {
    pub fn new(inner: Arc<dyn EventSink>) -> Self {
        Self {
            inner,
            events: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<serde_json::Value> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventSink for TraceSink {
    async fn send(&self, event: StreamEvent) -> Result<()> {
        self.events.lock().push(event.to_json());
        self.inner.send(event).await
    }
}
