//! # baton-flow
//!
//! Request orchestration above the canonical client: the assistant router,
//! the default and mapReduce chat strategies, and the workflow executor with
//! its slot table.

pub mod router;
pub mod strategies;
pub mod strategy;
pub mod workflow;

pub use router::{AssistantRouter, StrategyKind, select};
pub use strategies::{DefaultStrategy, MapReduceStrategy, MuxForwarder};
pub use strategy::{Assistant, StrategyContext, StrategyOutcome};
pub use workflow::{SlotValue, WorkflowExecutor, WorkflowStrategy};
