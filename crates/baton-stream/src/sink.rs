use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use baton_core::{BatonError, Result, StreamEvent};

/// Anything that accepts canonical stream events. Writes are awaited, so a
/// full downstream pauses upstream reads (back-pressure).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: StreamEvent) -> Result<()>;
}

/// The narrow surface a provider adapter writes through: incremental text
/// for one source, or a mid-stream error. Implemented by the multiplexer's
/// [`crate::SourceHandle`] and by [`crate::Collector`].
#[async_trait]
pub trait DeltaWriter: Send + Sync {
    async fn text(&self, chunk: &str) -> Result<()>;
    async fn error(&self, status_code: u16, message: &str) -> Result<()>;
}

/// Sink backed by a bounded channel. The receiver side is consumed by the
/// HTTP layer and turned into the SSE response body.
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelSink {
    /// Default channel capacity. Large enough to ride out bursts from a fast
    /// provider, small enough that a stalled client applies back-pressure.
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, event: StreamEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| BatonError::Cancelled)
    }
}

/// In-memory sink that records every event. Used by tests and by callers
/// that run a sub-stream they only inspect afterwards.
#[derive(Default)]
pub struct MemorySink {
    events: parking_lot::Mutex<Vec<StreamEvent>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().clone()
    }

    pub fn deltas_text(&self) -> String {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Delta { payload, .. } => payload.as_text().map(str::to_string),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn send(&self, event: StreamEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
