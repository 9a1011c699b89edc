//! # baton-stream
//!
//! The streaming spine of the gateway: an [`EventSink`] abstraction with
//! back-pressure, the [`Multiplexer`] that fuses N upstream sources into one
//! ordered client feed, the SSE body encoder, and the [`Collector`] used to
//! capture a sub-call's output while surfacing its progress.

pub mod collector;
pub mod multiplexer;
pub mod sink;
pub mod sse;

pub use collector::Collector;
pub use multiplexer::{Multiplexer, SourceHandle};
pub use sink::{ChannelSink, DeltaWriter, EventSink, MemorySink};
pub use sse::{SSE_CONTENT_TYPE, sse_body};
