use async_trait::async_trait;
use tracing::{debug, warn};

use baton_core::{BatonError, ChatMessage, DataSource, Result, StatusEvent};
use baton_sources::{generate_queries, inject_context, render_context};
use baton_stream::Collector;

use crate::strategy::{Assistant, StrategyContext, StrategyOutcome};

/// Characters per data-source context chunk.
const CHUNK_CHARS: usize = 20_000;

/// Split fetched document text into prompt-sized chunks.
fn chunk_text(text: &str, chunk_chars: usize) -> Vec<String> {
    if text.len() <= chunk_chars {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = rest.len().min(chunk_chars);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        // Prefer breaking on a paragraph edge.
        let cut = rest[..end].rfind("\n\n").filter(|p| *p > chunk_chars / 2);
        let end = cut.unwrap_or(end);
        chunks.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    chunks
}

/// Fetch every retrievable text source and chunk the content.
async fn gather_chunks(ctx: &StrategyContext<'_>, sources: &[DataSource]) -> Result<Vec<String>> {
    let Some(fetcher) = ctx.fetcher else {
        return Ok(vec![]);
    };
    let mut chunks = Vec::new();
    for source in sources {
        match fetcher.fetch(source).await {
            Ok(blob) => chunks.extend(chunk_text(&blob.text(), CHUNK_CHARS)),
            Err(e) => warn!(source = %source.id, error = %e, "content fetch failed"),
        }
    }
    Ok(chunks)
}

/// Attach retrieval context to the conversation when RAG applies.
async fn apply_rag(ctx: &StrategyContext<'_>, messages: &mut Vec<ChatMessage>) {
    if ctx.sources.retrievable() == 0 || ctx.base_options.skip_rag {
        return;
    }
    let Some(rag) = ctx.rag else { return };
    let Some(last) = ctx.request.last_user_text() else {
        return;
    };
    let queries = generate_queries(ctx.llm, &last, ctx.request.options.rag_only).await;
    match rag.retrieve(&ctx.llm.principal, ctx.sources, &queries).await {
        Ok(results) if !results.is_empty() => {
            debug!(hits = results.len(), "attaching retrieval context");
            let context = render_context(&results);
            inject_context(messages, &context, &ctx.llm.model);
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "retrieval failed, continuing without context"),
    }
}

/// The default strategy: one or more sequential prompts, one per data-source
/// context chunk, with the tool loop wrapped around the model call when any
/// tools are available.
pub struct DefaultStrategy;

#[async_trait]
impl Assistant for DefaultStrategy {
    fn name(&self) -> &'static str {
        "default"
    }

    async fn handle(&self, ctx: &StrategyContext<'_>) -> Result<Option<StrategyOutcome>> {
        let mut messages = ctx.request.messages.clone();
        apply_rag(ctx, &mut messages).await;

        // With RAG skipped, raw document content drives one prompt per chunk.
        let chunks: Vec<Option<String>> = if ctx.base_options.skip_rag
            && ctx.sources.retrievable() > 0
        {
            let fetched = gather_chunks(ctx, &ctx.sources.texts).await?;
            if fetched.is_empty() {
                vec![None]
            } else {
                fetched.into_iter().map(Some).collect()
            }
        } else {
            vec![None]
        };
        let multi = chunks.len() > 1;

        for (i, chunk) in chunks.into_iter().enumerate() {
            // Safe point between sequential contexts.
            if (ctx.kill)() {
                return Err(BatonError::Cancelled);
            }
            let source = if multi {
                ctx.mux.register(format!("chunk-{i}"))
            } else {
                ctx.mux.register("answer")
            };
            let mut context_messages = messages.clone();
            if let Some(chunk) = chunk {
                let insert_at = context_messages.len().saturating_sub(1);
                context_messages.insert(
                    insert_at,
                    ChatMessage::user(format!("Use this document content as context:\n{chunk}")),
                );
            }

            if !ctx.toolset.definitions.is_empty()
                && let Some(tool_loop) = ctx.tool_loop
            {
                tool_loop
                    .run(
                        ctx.llm,
                        context_messages,
                        &ctx.base_options,
                        &ctx.toolset,
                        ctx.mux,
                        &source,
                        ctx.request.options.mcp_client_side,
                        ctx.kill,
                    )
                    .await?;
            } else {
                ctx.llm
                    .chat(&context_messages, &ctx.base_options, &source)
                    .await?;
            }
            source.end().await?;
        }
        Ok(None)
    }
}

/// Map over every context chunk, then pairwise-reduce the partial answers
/// until one remains, streaming only the final reduction to the client.
pub struct MapReduceStrategy;

impl MapReduceStrategy {
    async fn call_collected(
        ctx: &StrategyContext<'_>,
        system: String,
        user: String,
    ) -> Result<String> {
        if (ctx.kill)() {
            return Err(BatonError::Cancelled);
        }
        let collector = Collector::new(ctx.status_forwarder());
        let mut options = ctx.base_options.clone();
        options.skip_rag = true;
        let reply = ctx
            .llm
            .chat(
                &[ChatMessage::system(system), ChatMessage::user(user)],
                &options,
                collector.as_ref(),
            )
            .await?;
        Ok(reply.content)
    }
}

impl StrategyContext<'_> {
    // Collector needs an owned sink handle; the multiplexer's own sink is
    // not exposed, so Status/State from sub-calls ride through a forwarder.
    pub fn status_forwarder(&self) -> std::sync::Arc<MuxForwarder> {
        std::sync::Arc::new(MuxForwarder {
            mux: std::sync::Arc::clone(self.mux),
        })
    }
}

/// Forwards Status/State events from an inner collector to the outer
/// multiplexed stream.
pub struct MuxForwarder {
    mux: std::sync::Arc<baton_stream::Multiplexer>,
}

#[async_trait]
impl baton_stream::EventSink for MuxForwarder {
    async fn send(&self, event: baton_core::StreamEvent) -> Result<()> {
        self.mux.forward(event).await
    }
}

#[async_trait]
impl Assistant for MapReduceStrategy {
    fn name(&self) -> &'static str {
        "mapReduce"
    }

    async fn handle(&self, ctx: &StrategyContext<'_>) -> Result<Option<StrategyOutcome>> {
        let question = ctx
            .request
            .last_user_text()
            .unwrap_or_else(|| "Summarize the attached content.".to_string());
        let chunks = gather_chunks(ctx, &ctx.sources.texts).await?;
        if chunks.is_empty() {
            return Ok(Some(StrategyOutcome::error(
                400,
                "mapReduce requires readable data sources",
            )));
        }

        ctx.mux
            .status(StatusEvent::running(
                "map",
                format!("Analyzing {} sections", chunks.len()),
            ))
            .await?;
        let mut partials = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let partial = Self::call_collected(
                ctx,
                format!("Answer using only this section of the document:\n{chunk}"),
                question.clone(),
            )
            .await?;
            partials.push(partial);
        }
        ctx.mux
            .status(StatusEvent::done("map", "Sections analyzed"))
            .await?;

        // Pairwise reduction until at most two partials remain.
        while partials.len() > 2 {
            let mut next = Vec::with_capacity(partials.len().div_ceil(2));
            for pair in partials.chunks(2) {
                if pair.len() == 1 {
                    next.push(pair[0].clone());
                    continue;
                }
                let combined = Self::call_collected(
                    ctx,
                    "Merge these two partial answers into one, keeping every distinct fact."
                        .to_string(),
                    format!("Answer A:\n{}\n\nAnswer B:\n{}", pair[0], pair[1]),
                )
                .await?;
                next.push(combined);
            }
            partials = next;
        }

        // The final reduction streams to the client.
        if (ctx.kill)() {
            return Err(BatonError::Cancelled);
        }
        let source = ctx.mux.register("answer");
        let mut options = ctx.base_options.clone();
        options.skip_rag = true;
        ctx.llm
            .chat(
                &[
                    ChatMessage::system(
                        "Combine the partial answers below into one complete answer to the \
                         user's question.",
                    ),
                    ChatMessage::user(format!(
                        "Question: {question}\n\nPartial answers:\n{}",
                        partials.join("\n---\n")
                    )),
                ],
                &options,
                &source,
            )
            .await?;
        source.end().await?;
        Ok(None)
    }
}
