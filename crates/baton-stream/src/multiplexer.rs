use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use baton_core::{DeltaPayload, Result, SourceRef, StatusEvent, StreamEvent};

use crate::sink::EventSink;

struct MuxState {
    /// Source ids in registration order; the position is the wire index.
    sources: Vec<String>,
    /// How many sources were listed in the Meta event (indices below this
    /// are valid on the wire; later registrations use textual ids).
    meta_len: Option<usize>,
    ended: HashSet<usize>,
}

/// Fuses N upstream source streams into one ordered feed on the outer sink.
///
/// Invariants enforced here:
/// - each source gets a stable small-integer index in registration order;
/// - exactly one `Meta` event precedes any `Delta`;
/// - per-source delta order is preserved (each handle writes sequentially);
/// - a source ending never closes the outer sink.
pub struct Multiplexer {
    sink: Arc<dyn EventSink>,
    state: Mutex<MuxState>,
    all_ended: Notify,
}

impl Multiplexer {
    pub fn new(sink: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            sink,
            state: Mutex::new(MuxState {
                sources: Vec::new(),
                meta_len: None,
                ended: HashSet::new(),
            }),
            all_ended: Notify::new(),
        })
    }

    /// Register a new source and get a handle for writing its events.
    pub fn register(self: &Arc<Self>, id: impl Into<String>) -> SourceHandle {
        let id = id.into();
        let index = {
            let mut state = self.state.lock();
            state.sources.push(id.clone());
            state.sources.len() - 1
        };
        debug!(source = %id, index, "registered stream source");
        SourceHandle {
            mux: Arc::clone(self),
            index,
            id,
        }
    }

    /// Emit the Meta event listing all sources known at this instant. Called
    /// implicitly before the first delta; calling again is a no-op.
    pub async fn send_meta(&self) -> Result<()> {
        let sources = {
            let mut state = self.state.lock();
            if state.meta_len.is_some() {
                return Ok(());
            }
            state.meta_len = Some(state.sources.len());
            state.sources.clone()
        };
        self.sink.send(StreamEvent::Meta { sources }).await
    }

    /// Advisory status — bypasses source ordering, serialized on the sink.
    pub async fn status(&self, status: StatusEvent) -> Result<()> {
        self.sink.send(StreamEvent::Status(status)).await
    }

    /// Push a named state patch to the client.
    pub async fn state(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.sink.send(StreamEvent::state_patch(key, value)).await
    }

    /// Forward an arbitrary event to the outer sink.
    pub async fn forward(&self, event: StreamEvent) -> Result<()> {
        self.sink.send(event).await
    }

    /// Resolves once every registered source has emitted its End.
    pub async fn wait_for_end(&self) {
        loop {
            let pending = {
                let state = self.state.lock();
                state.sources.len() - state.ended.len()
            };
            if pending == 0 {
                return;
            }
            self.all_ended.notified().await;
        }
    }

    fn source_ref_for(&self, index: usize, id: &str) -> SourceRef {
        let state = self.state.lock();
        match state.meta_len {
            Some(n) if index < n => SourceRef::Index(index),
            _ => SourceRef::Id(id.to_string()),
        }
    }

    async fn send_delta(&self, index: usize, id: &str, payload: DeltaPayload) -> Result<()> {
        self.send_meta().await?;
        let source = self.source_ref_for(index, id);
        self.sink.send(StreamEvent::Delta { source, payload }).await
    }

    async fn send_end(&self, index: usize, id: &str) -> Result<()> {
        self.send_meta().await?;
        let source = self.source_ref_for(index, id);
        let newly_ended = {
            let mut state = self.state.lock();
            state.ended.insert(index)
        };
        if newly_ended {
            self.sink
                .send(StreamEvent::End {
                    source: Some(source),
                })
                .await?;
            self.all_ended.notify_waiters();
        }
        Ok(())
    }

    /// Mid-stream failure of one source. The outer sink stays open.
    async fn send_error(&self, status_code: u16, status_text: String) -> Result<()> {
        self.sink
            .send(StreamEvent::Error {
                status_code,
                status_text,
            })
            .await
    }
}

/// Writer for a single registered source.
pub struct SourceHandle {
    mux: Arc<Multiplexer>,
    index: usize,
    id: String,
}

impl SourceHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub async fn delta_text(&self, text: impl Into<String>) -> Result<()> {
        self.mux
            .send_delta(self.index, &self.id, DeltaPayload::Text(text.into()))
            .await
    }

    pub async fn delta_json(&self, value: serde_json::Value) -> Result<()> {
        self.mux
            .send_delta(self.index, &self.id, DeltaPayload::Json(value))
            .await
    }

    /// Mark this source as finished. Idempotent.
    pub async fn end(&self) -> Result<()> {
        self.mux.send_end(self.index, &self.id).await
    }

    /// Report a mid-stream provider failure on this source.
    pub async fn error(&self, status_code: u16, status_text: impl Into<String>) -> Result<()> {
        self.mux.send_error(status_code, status_text.into()).await
    }
}

#[async_trait::async_trait]
impl crate::sink::DeltaWriter for SourceHandle {
    async fn text(&self, chunk: &str) -> Result<()> {
        self.delta_text(chunk).await
    }

    async fn error(&self, status_code: u16, message: &str) -> Result<()> {
        SourceHandle::error(self, status_code, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    #[tokio::test]
    async fn test_meta_precedes_all_deltas() {
        let sink = MemorySink::new();
        let mux = Multiplexer::new(sink.clone());
        let a = mux.register("a");
        let b = mux.register("b");
        a.delta_text("1").await.unwrap();
        b.delta_text("2").await.unwrap();

        let events = sink.events();
        assert!(matches!(&events[0], StreamEvent::Meta { sources } if sources == &vec!["a".to_string(), "b".to_string()]));
        assert!(
            events
                .iter()
                .skip(1)
                .all(|e| !matches!(e, StreamEvent::Meta { .. })),
            "exactly one Meta"
        );
    }

    #[tokio::test]
    async fn test_per_source_order_preserved() {
        let sink = MemorySink::new();
        let mux = Multiplexer::new(sink.clone());
        let a = mux.register("a");
        for i in 0..5 {
            a.delta_text(i.to_string()).await.unwrap();
        }
        let texts: Vec<String> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                StreamEvent::Delta { payload, .. } => {
                    payload.as_text().map(str::to_string)
                }
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_pre_meta_sources_use_integer_index() {
        let sink = MemorySink::new();
        let mux = Multiplexer::new(sink.clone());
        let a = mux.register("answer");
        a.delta_text("x").await.unwrap();
        let events = sink.events();
        assert!(matches!(
            &events[1],
            StreamEvent::Delta {
                source: SourceRef::Index(0),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_post_meta_sources_use_textual_id() {
        let sink = MemorySink::new();
        let mux = Multiplexer::new(sink.clone());
        let a = mux.register("a");
        a.delta_text("x").await.unwrap(); // triggers Meta with ["a"]
        let late = mux.register("late");
        late.delta_text("y").await.unwrap();
        let events = sink.events();
        let last = events.last().unwrap();
        assert!(matches!(
            last,
            StreamEvent::Delta {
                source: SourceRef::Id(id),
                ..
            } if id == "late"
        ));
    }

    #[tokio::test]
    async fn test_source_end_does_not_close_sink() {
        let sink = MemorySink::new();
        let mux = Multiplexer::new(sink.clone());
        let a = mux.register("a");
        let b = mux.register("b");
        a.end().await.unwrap();
        b.delta_text("still flowing").await.unwrap();
        assert_eq!(sink.deltas_text(), "still flowing");
    }

    #[tokio::test]
    async fn test_wait_for_end_resolves_when_all_sources_end() {
        let sink = MemorySink::new();
        let mux = Multiplexer::new(sink.clone());
        let a = mux.register("a");
        let b = mux.register("b");

        let waiter = {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move { mux.wait_for_end().await })
        };
        a.end().await.unwrap();
        assert!(!waiter.is_finished());
        b.end().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait_for_end resolved")
            .unwrap();
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let sink = MemorySink::new();
        let mux = Multiplexer::new(sink.clone());
        let a = mux.register("a");
        a.end().await.unwrap();
        a.end().await.unwrap();
        let ends = sink
            .events()
            .iter()
            .filter(|e| matches!(e, StreamEvent::End { .. }))
            .count();
        assert_eq!(ends, 1);
    }
}
