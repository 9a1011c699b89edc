use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use baton_core::{Result, StreamEvent};

use crate::sink::EventSink;

/// Wraps an outer sink for the duration of one workflow step (or one
/// utility LLM call): deltas are buffered into a result string instead of
/// reaching the client, while Status and State events pass through so the
/// user still sees progress.
pub struct Collector {
    outer: Option<Arc<dyn EventSink>>,
    buf: Mutex<String>,
    error: Mutex<Option<(u16, String)>>,
}

impl Collector {
    /// Collector that surfaces Status/State on `outer`.
    pub fn new(outer: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            outer: Some(outer),
            buf: Mutex::new(String::new()),
            error: Mutex::new(None),
        })
    }

    /// Collector that swallows everything except deltas — for internal
    /// utility calls with no user-visible progress.
    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            outer: None,
            buf: Mutex::new(String::new()),
            error: Mutex::new(None),
        })
    }

    /// The accumulated delta text.
    pub fn result(&self) -> String {
        self.buf.lock().clone()
    }

    /// The first stream error observed, if any.
    pub fn error(&self) -> Option<(u16, String)> {
        self.error.lock().clone()
    }
}

#[async_trait]
impl EventSink for Collector {
    async fn send(&self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Delta { payload, .. } => {
                if let Some(text) = payload.as_text() {
                    self.buf.lock().push_str(text);
                }
                Ok(())
            }
            StreamEvent::Result { value } => {
                let mut buf = self.buf.lock();
                buf.clear();
                match value.as_str() {
                    Some(s) => buf.push_str(s),
                    None => buf.push_str(&value.to_string()),
                }
                Ok(())
            }
            StreamEvent::Error {
                status_code,
                status_text,
            } => {
                let mut err = self.error.lock();
                if err.is_none() {
                    *err = Some((status_code, status_text));
                }
                Ok(())
            }
            ev @ (StreamEvent::Status(_) | StreamEvent::State(_)) => match &self.outer {
                Some(outer) => outer.send(ev).await,
                None => Ok(()),
            },
            // Meta/End of the inner call never reach the outer stream.
            StreamEvent::Meta { .. } | StreamEvent::End { .. } => Ok(()),
        }
    }
}

#[async_trait]
impl crate::sink::DeltaWriter for Collector {
    async fn text(&self, chunk: &str) -> Result<()> {
        self.buf.lock().push_str(chunk);
        Ok(())
    }

    async fn error(&self, status_code: u16, message: &str) -> Result<()> {
        let mut err = self.error.lock();
        if err.is_none() {
            *err = Some((status_code, message.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use baton_core::{DeltaPayload, StatusEvent};

    #[tokio::test]
    async fn test_collects_deltas_and_forwards_status() {
        let outer = MemorySink::new();
        let collector = Collector::new(outer.clone());
        collector
            .send(StreamEvent::Status(StatusEvent::running("s1", "working")))
            .await
            .unwrap();
        for part in ["hel", "lo"] {
            collector
                .send(StreamEvent::Delta {
                    source: 0.into(),
                    payload: DeltaPayload::Text(part.into()),
                })
                .await
                .unwrap();
        }
        collector.send(StreamEvent::end()).await.unwrap();

        assert_eq!(collector.result(), "hello");
        let outer_events = outer.events();
        assert_eq!(outer_events.len(), 1, "only the status leaked out");
        assert!(matches!(outer_events[0], StreamEvent::Status(_)));
    }

    #[tokio::test]
    async fn test_records_first_error() {
        let collector = Collector::silent();
        collector
            .send(StreamEvent::Error {
                status_code: 500,
                status_text: "boom".into(),
            })
            .await
            .unwrap();
        collector
            .send(StreamEvent::Error {
                status_code: 400,
                status_text: "later".into(),
            })
            .await
            .unwrap();
        assert_eq!(collector.error(), Some((500, "boom".into())));
    }
}
