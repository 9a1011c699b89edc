//! # baton-server
//!
//! The HTTP edge of the gateway: the streaming chat endpoint (SSE), the
//! kill-switch control shape, the data-source request shape, and the model
//! catalog routes — plus in-flight request tracking and usage metrics.

pub mod gateway;
pub mod metrics;
pub mod state;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use baton_core::{BatonError, ChatRequest, Principal, Result};
use baton_stream::{ChannelSink, SSE_CONTENT_TYPE, sse_body};

pub use gateway::{CountingSink, Gateway, PreparedChat, TraceSink};
pub use metrics::Metrics;
pub use state::{RequestRegistry, RequestState};

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

/// Build the Axum router.
pub fn build_router(gateway: Arc<Gateway>) -> Router {
    let cors = gateway.config.server.cors;
    let state = AppState { gateway };

    let mut router = Router::new()
        .route("/chat", post(chat_handler))
        .route("/available_models", get(available_models_handler))
        .route("/model_aliases", get(model_aliases_handler))
        .route("/models_with_aliases", get(models_with_aliases_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    if cors {
        router = router.layer(CorsLayer::permissive());
    }
    router
}

/// Start the HTTP server and the background sweepers.
pub async fn start_server(gateway: Arc<Gateway>) -> Result<()> {
    let listen = gateway.config.server.listen.clone();

    // Periodic trims: stale request states and idle breaker keys.
    tokio::spawn({
        let gateway = gateway.clone();
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(300)).await;
                gateway.requests.cleanup();
                gateway.breakers.sweep();
            }
        }
    });

    let router = build_router(gateway);
    info!(listen = %listen, "starting gateway");
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .map_err(|e| BatonError::Internal(format!("failed to bind {listen}: {e}")))?;
    axum::serve(listener, router)
        .await
        .map_err(|e| BatonError::Internal(format!("server error: {e}")))?;
    Ok(())
}

/// Resolve the caller's bearer token to a verified principal.
async fn principal_from_headers(gateway: &Gateway, headers: &HeaderMap) -> Result<Principal> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| BatonError::Unauthorized("missing bearer token".into()))?;
    gateway.tables.principal_for_token(token).await
}

fn error_response(e: &BatonError) -> Response {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"error": e.to_string()}))).into_response()
}

/// The one chat endpoint: control, data-source, and streaming chat shapes.
async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let gateway = &state.gateway;
    gateway.metrics.inc_http_requests();

    let principal = match principal_from_headers(gateway, &headers).await {
        Ok(principal) => principal,
        Err(e) => {
            gateway.metrics.inc_http_errors();
            return error_response(&e);
        }
    };

    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            gateway.metrics.inc_http_errors();
            return error_response(&BatonError::InvalidRequest(format!("bad body: {e}")));
        }
    };
    if !request.is_actionable() {
        gateway.metrics.inc_http_errors();
        return error_response(&BatonError::InvalidRequest(
            "body must carry messages, a kill switch, or a data-source request".into(),
        ));
    }

    // Control shape: flip the kill switch and answer immediately.
    if let Some(kill) = &request.kill_switch {
        let found = gateway.control(&principal, kill);
        return Json(json!({"status": "ok", "found": found})).into_response();
    }

    // Data-source shape: describe or fetch one resolved source.
    if let Some(ds_request) = &request.datasource_request {
        return datasource_response(gateway, &principal, ds_request).await;
    }

    // Chat shape. Admission and resolution run under the extraction timeout
    // and surface as plain HTTP errors; after that the SSE stream owns all
    // error reporting.
    let extraction = Duration::from_secs(gateway.config.server.extraction_timeout_secs);
    let prepared =
        match tokio::time::timeout(extraction, gateway.prepare(principal, request)).await {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(e)) => {
                gateway.metrics.inc_http_errors();
                return error_response(&e);
            }
            Err(_) => {
                gateway.metrics.inc_http_errors();
                warn!("request extraction timed out");
                return error_response(&BatonError::Timeout {
                    seconds: extraction.as_secs(),
                });
            }
        };

    let (sink, rx) = ChannelSink::new(ChannelSink::DEFAULT_CAPACITY);
    tokio::spawn({
        let gateway = gateway.clone();
        async move {
            gateway.run(prepared, sink).await;
        }
    });

    let stream = sse_body(rx).map(|record| Ok::<_, std::convert::Infallible>(record.into_bytes()));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, SSE_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn datasource_response(
    gateway: &Arc<Gateway>,
    principal: &Principal,
    request: &baton_core::DataSourceRequest,
) -> Response {
    let source = baton_core::DataSource::new(request.id.clone());
    let resolved = gateway
        .resolver
        .resolve(principal, std::slice::from_ref(&source), &[], None)
        .await;
    if let Err(e) = resolved {
        gateway.metrics.inc_http_errors();
        return error_response(&e);
    }
    match request.op {
        baton_core::DataSourceOp::Describe => Json(json!({
            "id": source.id,
            "owner": source.owner(),
            "scheme": source.scheme(),
            "key": source.key(),
        }))
        .into_response(),
        baton_core::DataSourceOp::Fetch => {
            use baton_core::BlobFetcher;
            let fetcher = baton_sources::HttpBlobFetcher::new(
                gateway.config.retrieval.api_base_url.clone(),
                principal.access_token.clone(),
            );
            match fetcher.fetch(&source).await {
                Ok(blob) => Json(json!({
                    "id": source.id,
                    "contentType": blob.content_type,
                    "content": blob.text(),
                }))
                .into_response(),
                Err(e) => {
                    gateway.metrics.inc_http_errors();
                    error_response(&e)
                }
            }
        }
    }
}

async fn available_models_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let gateway = &state.gateway;
    gateway.metrics.inc_http_requests();
    let principal = match principal_from_headers(gateway, &headers).await {
        Ok(principal) => principal,
        Err(e) => return error_response(&e),
    };
    match gateway.catalog.user_available_models(&principal).await {
        Ok(models) => Json(json!({
            "models": models.models_by_id,
            "cheapest": models.cheapest,
            "advanced": models.advanced,
            "documentCaching": models.document_caching,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn model_aliases_handler(State(state): State<AppState>) -> Response {
    state.gateway.metrics.inc_http_requests();
    Json(json!({"aliases": state.gateway.aliases.all()})).into_response()
}

async fn models_with_aliases_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let gateway = &state.gateway;
    gateway.metrics.inc_http_requests();
    let principal = match principal_from_headers(gateway, &headers).await {
        Ok(principal) => principal,
        Err(e) => return error_response(&e),
    };
    match gateway.catalog.user_available_models(&principal).await {
        Ok(models) => Json(json!({
            "models": models.models_by_id,
            "aliases": gateway.aliases.all(),
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "in_flight": state.gateway.requests.len(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.gateway.metrics.render_prometheus(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_config::BatonConfig;
    use baton_core::{
        AliasInfo, ChatMessage, ModelDescriptor, ProviderKind, StreamEvent,
    };
    use baton_flow::AssistantRouter;
    use baton_limits::{BreakerConfig, BreakerRegistry, RateLimiter};
    use baton_llm::{LlmClient, MockOutcome, MockProvider};
    use baton_registry::{AliasRegistry, ModelCatalog};
    use baton_sources::SourceResolver;
    use baton_store::{Item, MemoryStore, TABLE_ADMIN, Tables};
    use baton_tools::McpRegistry;
    use std::collections::HashMap;

    fn opus_model() -> ModelDescriptor {
        ModelDescriptor {
            id: "us.anthropic.claude-opus-4-6-v1:0".into(),
            provider: ProviderKind::Bedrock,
            context_window: 200_000,
            output_token_limit: 8192,
            supports_images: true,
            supports_system_prompts: true,
            supports_reasoning: true,
            system_prompt_suffix: None,
            image_limit: 10,
            input_rate: 15e-6,
            output_rate: 75e-6,
        }
    }

    async fn test_gateway(provider: Arc<MockProvider>) -> Arc<Gateway> {
        let store = Arc::new(MemoryStore::new());
        let tables = Tables::new(store);
        tables.put_model(&opus_model()).await.unwrap();

        let mut aliases = HashMap::new();
        aliases.insert(
            "opus-latest".to_string(),
            AliasInfo {
                resolves_to: "us.anthropic.claude-opus-4-6-v1:0".to_string(),
                category: "chat".to_string(),
                tier: "advanced".to_string(),
                description: String::new(),
            },
        );

        Arc::new(Gateway {
            config: BatonConfig::default(),
            tables: tables.clone(),
            limiter: RateLimiter::new(tables.clone()),
            breakers: BreakerRegistry::new(BreakerConfig::default()),
            aliases: AliasRegistry::from_map(aliases),
            catalog: ModelCatalog::new(tables.clone()),
            llm: Arc::new(
                LlmClient::new().with_provider(ProviderKind::Bedrock, provider),
            ),
            resolver: SourceResolver::new(tables.clone()),
            rag: None,
            search: None,
            mcp: Arc::new(McpRegistry::new(tables)),
            router: AssistantRouter::new(),
            requests: RequestRegistry::new(),
            metrics: Metrics::new(),
        })
    }

    fn chat_request(model: &str, request_id: &str) -> ChatRequest {
        let mut request = ChatRequest {
            messages: vec![ChatMessage::user("hello")],
            ..Default::default()
        };
        request.options.model.id = model.to_string();
        request.options.request_id = Some(request_id.to_string());
        request.options.conversation_id = Some("c1".to_string());
        request
    }

    async fn run_to_events(gateway: &Arc<Gateway>, request: ChatRequest) -> Vec<StreamEvent> {
        let prepared = gateway
            .prepare(Principal::new("u@x.com", "tok"), request)
            .await
            .unwrap();
        let (sink, mut rx) = ChannelSink::new(64);
        gateway.run(prepared, sink).await;
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn test_simple_streaming_chat_via_alias() {
        let provider = Arc::new(MockProvider::scripted(
            ProviderKind::Bedrock,
            vec![MockOutcome::text("hello there")],
        ));
        let gateway = test_gateway(provider.clone()).await;
        let events = run_to_events(&gateway, chat_request("opus-latest", "r1")).await;

        // Meta with one source, at least one non-empty delta, then End.
        let meta_pos = events
            .iter()
            .position(|e| matches!(e, StreamEvent::Meta { sources } if sources.len() == 1))
            .expect("meta event");
        let delta_pos = events
            .iter()
            .position(|e| {
                matches!(e, StreamEvent::Delta { payload, .. }
                    if payload.as_text().is_some_and(|t| !t.is_empty()))
            })
            .expect("delta event");
        assert!(meta_pos < delta_pos);
        assert!(matches!(events.last(), Some(StreamEvent::End { source: None })));

        // The alias resolved before dispatch.
        assert_eq!(
            provider.calls()[0].model_id,
            "us.anthropic.claude-opus-4-6-v1:0"
        );
    }

    #[tokio::test]
    async fn test_concrete_model_id_passes_through() {
        let provider = Arc::new(MockProvider::scripted(
            ProviderKind::Bedrock,
            vec![MockOutcome::text("ok")],
        ));
        let gateway = test_gateway(provider.clone()).await;
        run_to_events(
            &gateway,
            chat_request("us.anthropic.claude-opus-4-6-v1:0", "r2"),
        )
        .await;
        assert_eq!(
            provider.calls()[0].model_id,
            "us.anthropic.claude-opus-4-6-v1:0"
        );
    }

    #[tokio::test]
    async fn test_rate_limited_request_rejected_before_streaming() {
        let provider = Arc::new(MockProvider::new(ProviderKind::Bedrock));
        let gateway = test_gateway(provider.clone()).await;
        gateway
            .tables
            .store()
            .put(
                TABLE_ADMIN,
                Item::new(
                    "limits",
                    "admin",
                    json!({"kind": "admin", "period": "daily", "rate": 10.0}),
                ),
            )
            .await
            .unwrap();
        gateway.tables.add_charge("u@x.com", 12.5).await.unwrap();

        let err = gateway
            .prepare(
                Principal::new("u@x.com", "tok"),
                chat_request("opus-latest", "r3"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 429);
        let message = err.to_string();
        assert!(message.contains("Request limit reached"), "{message}");
        assert!(message.contains("$12.50 spent today (Admin limit)"), "{message}");
        assert!(message.contains("$10.00 / Daily"), "{message}");
        // No provider call was made.
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_model_rejected() {
        let provider = Arc::new(MockProvider::new(ProviderKind::Bedrock));
        let gateway = test_gateway(provider).await;
        let err = gateway
            .prepare(
                Principal::new("u@x.com", "tok"),
                chat_request("no-such-model", "r4"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let provider = Arc::new(MockProvider::new(ProviderKind::Bedrock));
        let gateway = test_gateway(provider).await;
        let principal = Principal::new("u@x.com", "tok");
        let _held = gateway
            .prepare(principal.clone(), chat_request("opus-latest", "r5"))
            .await
            .unwrap();
        let err = gateway
            .prepare(principal, chat_request("opus-latest", "r5"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_denied_data_source_is_401() {
        let provider = Arc::new(MockProvider::new(ProviderKind::Bedrock));
        let gateway = test_gateway(provider).await;
        let mut request = chat_request("opus-latest", "r6");
        request.data_sources = vec![baton_core::DataSource::new("s3://bob@x.com/secret.txt")];
        let err = gateway
            .prepare(Principal::new("u@x.com", "tok"), request)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn test_usage_recorded_after_stream() {
        let provider = Arc::new(MockProvider::scripted(
            ProviderKind::Bedrock,
            vec![MockOutcome::text("four words of text")],
        ));
        let gateway = test_gateway(provider).await;
        run_to_events(&gateway, chat_request("opus-latest", "r7")).await;
        let record = gateway.tables.cost_record("u@x.com").await.unwrap();
        assert!(record.daily > 0.0, "charge was recorded");
        let rendered = gateway.metrics.render_prometheus();
        assert!(rendered.contains("baton_chat_streams_total 1"));
    }
}
