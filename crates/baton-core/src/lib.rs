//! # baton-core
//!
//! Core types for the Baton gateway: the canonical message and stream-event
//! model, request/option shapes, data-source references, and the unified
//! error taxonomy. Every other crate in the workspace builds on these.

pub mod error;
pub mod event;
pub mod fetch;
pub mod message;
pub mod options;
pub mod request;
pub mod types;
pub mod workflow;

pub use error::{BatonError, LimitExceeded, LimitKind, Result};
pub use fetch::{Blob, BlobFetcher};
pub use event::{DeltaPayload, SourceRef, StatusEvent, StreamEvent};
pub use message::{
    AssistantReply, ChatMessage, ContentPart, MessageContent, Role, ToolCall, ToolDefinition,
};
pub use options::{CallOptions, ChatOptions, ModelChoice, ProviderOptions, ReasoningLevel};
pub use request::{ChatRequest, DataSourceOp, DataSourceRequest, KillSwitch};
pub use types::{
    AliasInfo, DataSource, LimitPeriod, ModelDescriptor, Principal, ProviderKind, RateLimit,
    extract_owner,
};
pub use workflow::{StepKind, Workflow, WorkflowStep};
