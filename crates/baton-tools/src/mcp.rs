use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use baton_core::{BatonError, Result, ToolDefinition};
use baton_store::{McpServerConfig, Tables};

/// Prefix that marks a tool as remote.
pub const MCP_TOOL_PREFIX: &str = "mcp_";

/// Connection handshakes must finish within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON-RPC client for one remote tool server.
pub struct McpClient {
    http: reqwest::Client,
    server: McpServerConfig,
    next_id: AtomicI64,
}

impl McpClient {
    fn new(server: McpServerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            server,
            next_id: AtomicI64::new(1),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut req = self.http.post(&self.server.url).json(&body);
        if let Some(token) = &self.server.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| BatonError::Tool {
            tool: method.to_string(),
            message: format!("{}: {e}", self.server.name),
        })?;
        if !resp.status().is_success() {
            return Err(BatonError::Tool {
                tool: method.to_string(),
                message: format!("{} returned {}", self.server.name, resp.status()),
            });
        }
        let payload: Value = resp.json().await.map_err(|e| BatonError::Tool {
            tool: method.to_string(),
            message: e.to_string(),
        })?;
        if let Some(err) = payload.get("error").filter(|e| !e.is_null()) {
            return Err(BatonError::Tool {
                tool: method.to_string(),
                message: err["message"].as_str().unwrap_or("rpc error").to_string(),
            });
        }
        Ok(payload["result"].clone())
    }

    async fn initialize(&self) -> Result<()> {
        let result = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            self.rpc(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "baton", "version": env!("CARGO_PKG_VERSION")},
                }),
            ),
        )
        .await
        .map_err(|_| BatonError::Tool {
            tool: "initialize".into(),
            message: format!("{} handshake timed out", self.server.name),
        })??;
        debug!(server = %self.server.name, ?result, "MCP server initialized");
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let result = self.rpc("tools/list", json!({})).await?;
        let tools = result["tools"]
            .as_array()
            .map(|tools| {
                tools
                    .iter()
                    .map(|t| ToolDefinition {
                        name: t["name"].as_str().unwrap_or_default().to_string(),
                        description: t["description"].as_str().unwrap_or_default().to_string(),
                        parameters: t
                            .get("inputSchema")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object"})),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: &Value) -> Result<String> {
        let result = self
            .rpc("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        // Concatenate text content blocks; non-text blocks ride as JSON.
        let content = result["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .map(|b| match b["type"].as_str() {
                        Some("text") => b["text"].as_str().unwrap_or_default().to_string(),
                        _ => b.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_else(|| result.to_string());
        if result["isError"].as_bool().unwrap_or(false) {
            return Err(BatonError::Tool {
                tool: name.to_string(),
                message: content,
            });
        }
        Ok(content)
    }
}

/// The set of tools offered to the model for one request, with the mapping
/// from prefixed names back to `(server, tool)`.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    pub definitions: Vec<ToolDefinition>,
    mcp_routes: HashMap<String, (String, String)>,
}

impl ToolSet {
    pub fn push_builtin(&mut self, def: ToolDefinition) {
        self.definitions.push(def);
    }

    pub fn push_mcp(&mut self, server: &str, def: ToolDefinition) {
        let exposed = format!("{MCP_TOOL_PREFIX}{server}_{}", def.name);
        self.mcp_routes
            .insert(exposed.clone(), (server.to_string(), def.name.clone()));
        self.definitions.push(ToolDefinition {
            name: exposed,
            ..def
        });
    }

    /// Fold another tool set into this one.
    pub fn merge(&mut self, other: ToolSet) {
        self.definitions.extend(other.definitions);
        self.mcp_routes.extend(other.mcp_routes);
    }

    /// Resolve a prefixed tool name back to its server and original name.
    pub fn route(&self, exposed_name: &str) -> Option<(&str, &str)> {
        self.mcp_routes
            .get(exposed_name)
            .map(|(s, t)| (s.as_str(), t.as_str()))
    }

    pub fn is_mcp(&self, name: &str) -> bool {
        name.starts_with(MCP_TOOL_PREFIX)
    }
}

/// Invokes remote tools for one user. Implemented by [`McpRegistry`];
/// swapped for a fake in tests.
#[async_trait]
pub trait McpExecutor: Send + Sync {
    async fn call(&self, user_id: &str, server: &str, tool: &str, args: &Value) -> Result<String>;
}

/// Shared registry of live MCP connections, keyed `(user, server)`.
/// Handshakes are single-flight: concurrent first calls to the same server
/// wait on one connection attempt.
pub struct McpRegistry {
    tables: Tables,
    connections: DashMap<(String, String), Arc<McpClient>>,
    connecting: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl McpRegistry {
    pub fn new(tables: Tables) -> Self {
        Self {
            tables,
            connections: DashMap::new(),
            connecting: DashMap::new(),
        }
    }

    /// Build the user's tool set: every tool advertised by every server in
    /// their registry, exposed under the `mcp_` prefix. A server that fails
    /// to answer is skipped.
    pub async fn user_toolset(&self, user_id: &str) -> ToolSet {
        let mut set = ToolSet::default();
        let servers = match self.tables.mcp_servers(user_id).await {
            Ok(servers) => servers,
            Err(e) => {
                warn!(error = %e, "MCP registry lookup failed");
                return set;
            }
        };
        for server in servers {
            match self.connect(user_id, &server.name).await {
                Ok(client) => match client.list_tools().await {
                    Ok(tools) => {
                        for tool in tools {
                            set.push_mcp(&server.name, tool);
                        }
                    }
                    Err(e) => warn!(server = %server.name, error = %e, "tools/list failed"),
                },
                Err(e) => warn!(server = %server.name, error = %e, "MCP connect failed"),
            }
        }
        set
    }

    /// Get or establish the connection for `(user, server)`.
    async fn connect(&self, user_id: &str, server_name: &str) -> Result<Arc<McpClient>> {
        let key = (user_id.to_string(), server_name.to_string());
        if let Some(client) = self.connections.get(&key) {
            return Ok(client.clone());
        }

        let gate = self
            .connecting
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = gate.lock().await;
        // Another task may have finished the handshake while we waited.
        if let Some(client) = self.connections.get(&key) {
            return Ok(client.clone());
        }

        let server = self
            .tables
            .mcp_servers(user_id)
            .await?
            .into_iter()
            .find(|s| s.name == server_name)
            .ok_or_else(|| BatonError::Tool {
                tool: server_name.to_string(),
                message: "server not registered".into(),
            })?;
        let client = Arc::new(McpClient::new(server));
        client.initialize().await?;
        info!(user = %user_id, server = %server_name, "MCP connection established");
        self.connections.insert(key.clone(), client.clone());
        self.connecting.remove(&key);
        Ok(client)
    }
}

#[async_trait]
impl McpExecutor for McpRegistry {
    async fn call(&self, user_id: &str, server: &str, tool: &str, args: &Value) -> Result<String> {
        let client = self.connect(user_id, server).await?;
        client.call_tool(tool, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toolset_routes_prefixed_names() {
        let mut set = ToolSet::default();
        set.push_mcp(
            "jira",
            ToolDefinition {
                name: "create_issue".into(),
                description: "create".into(),
                parameters: json!({"type": "object"}),
            },
        );
        assert_eq!(set.definitions[0].name, "mcp_jira_create_issue");
        assert_eq!(set.route("mcp_jira_create_issue"), Some(("jira", "create_issue")));
        assert!(set.is_mcp("mcp_jira_create_issue"));
        assert!(!set.is_mcp("web_search"));
    }

    #[test]
    fn test_builtin_tools_not_routed() {
        let mut set = ToolSet::default();
        set.push_builtin(ToolDefinition {
            name: "web_search".into(),
            description: String::new(),
            parameters: json!({}),
        });
        assert!(set.route("web_search").is_none());
    }
}
