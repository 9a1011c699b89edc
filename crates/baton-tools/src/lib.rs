//! # baton-tools
//!
//! The function-calling layer: the bounded tool-loop executor, the built-in
//! web-search tool (Brave → Tavily → Serper → SerpAPI fall-through), and the
//! JSON-RPC client for user-registered remote tool (MCP) servers with cached,
//! single-flight connections.

pub mod mcp;
pub mod toolloop;
pub mod websearch;

pub use mcp::{MCP_TOOL_PREFIX, McpClient, McpExecutor, McpRegistry, ToolSet};
pub use toolloop::{MAX_TOOL_ITERATIONS, ToolLoop, ToolLoopOutcome};
pub use websearch::{
    SearchBackend, SearchExecutor, SearchHit, WEB_SEARCH_TOOL, WebSearchResult, WebSearcher,
    web_search_tool,
};
