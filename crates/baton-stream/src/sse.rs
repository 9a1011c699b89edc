use futures::stream::Stream;
use tokio::sync::mpsc;

use baton_core::StreamEvent;

/// Content type of the streaming response.
pub const SSE_CONTENT_TYPE: &str = "text/event-stream";

/// Turn a stream-event receiver into the SSE body: newline-terminated
/// `data: <JSON>\n` records, finishing after the terminal event.
///
/// The terminal event is always forwarded before the stream closes, so a
/// client either sees `{"type":"end"}` or `{"type":"error",...}` — never a
/// silently dropped connection.
pub fn sse_body(mut rx: mpsc::Receiver<StreamEvent>) -> impl Stream<Item = String> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            yield event.to_wire();
            if terminal {
                break;
            }
        }
    }
}
