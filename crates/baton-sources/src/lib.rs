//! # baton-sources
//!
//! Data-source resolution — ownership and access-record checks, tag
//! expansion, partitioning into text/image/group/AST/object subsets — and
//! the RAG retrieval client with FAQ query generation, merge/dedupe, and
//! context injection.

pub mod fetch;
pub mod rag;
pub mod resolver;

pub use fetch::HttpBlobFetcher;
pub use rag::{
    RagClient, RagResult, generate_queries, inject_context, merge_results, parse_results,
    render_context,
};
pub use resolver::{ResolvedSources, SourceResolver};
