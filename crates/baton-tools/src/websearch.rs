use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use baton_config::SearchConfig;
use baton_core::{BatonError, Result, ToolDefinition};

/// Name of the built-in search tool as the model sees it.
pub const WEB_SEARCH_TOOL: &str = "web_search";

/// Search backends in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchBackend {
    Brave,
    Tavily,
    Serper,
    SerpApi,
}

impl SearchBackend {
    pub fn label(&self) -> &'static str {
        match self {
            SearchBackend::Brave => "brave",
            SearchBackend::Tavily => "tavily",
            SearchBackend::Serper => "serper",
            SearchBackend::SerpApi => "serpapi",
        }
    }
}

/// One normalized hit.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub description: String,
}

/// Normalized search outcome, independent of the backend that served it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebSearchResult {
    pub provider: String,
    pub query: String,
    pub results: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

impl WebSearchResult {
    /// Markdown rendering fed back to the model as the tool result.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("Web search results for \"{}\":\n", self.query);
        if let Some(answer) = &self.answer {
            out.push_str(&format!("\nAnswer: {answer}\n"));
        }
        for (i, hit) in self.results.iter().enumerate() {
            out.push_str(&format!(
                "\n{}. [{}]({})\n   {}\n",
                i + 1,
                hit.title,
                hit.url,
                hit.description
            ));
        }
        if self.results.is_empty() {
            out.push_str("\nNo results found.\n");
        }
        out
    }
}

/// Executes a web search. The production implementation walks the configured
/// backends in priority order.
#[async_trait]
pub trait SearchExecutor: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<WebSearchResult>;
}

/// Tool definition handed to the model when any backend is configured.
pub fn web_search_tool() -> ToolDefinition {
    ToolDefinition {
        name: WEB_SEARCH_TOOL.into(),
        description: "Search the web for current information. Returns titles, URLs, and \
                      descriptions of matching pages."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
            },
            "required": ["query"],
        }),
    }
}

/// Multi-backend searcher: Brave, then Tavily, then Serper, then SerpAPI.
/// A transport error falls through to the next configured backend.
pub struct WebSearcher {
    client: reqwest::Client,
    config: SearchConfig,
}

impl WebSearcher {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn backends(&self) -> Vec<SearchBackend> {
        let mut backends = Vec::new();
        if self.config.brave_api_key.is_some() {
            backends.push(SearchBackend::Brave);
        }
        if self.config.tavily_api_key.is_some() {
            backends.push(SearchBackend::Tavily);
        }
        if self.config.serper_api_key.is_some() {
            backends.push(SearchBackend::Serper);
        }
        if self.config.serpapi_api_key.is_some() {
            backends.push(SearchBackend::SerpApi);
        }
        backends
    }

    async fn search_one(
        &self,
        backend: SearchBackend,
        query: &str,
        max_results: usize,
    ) -> Result<WebSearchResult> {
        let payload = match backend {
            SearchBackend::Brave => {
                let key = self.config.brave_api_key.as_deref().unwrap_or_default();
                self.client
                    .get("https://api.search.brave.com/res/v1/web/search")
                    .header("X-Subscription-Token", key)
                    .header("Accept", "application/json")
                    .query(&[("q", query), ("count", &max_results.to_string())])
                    .send()
                    .await
            }
            SearchBackend::Tavily => {
                let key = self.config.tavily_api_key.as_deref().unwrap_or_default();
                self.client
                    .post("https://api.tavily.com/search")
                    .json(&json!({
                        "api_key": key,
                        "query": query,
                        "max_results": max_results,
                        "include_answer": true,
                    }))
                    .send()
                    .await
            }
            SearchBackend::Serper => {
                let key = self.config.serper_api_key.as_deref().unwrap_or_default();
                self.client
                    .post("https://google.serper.dev/search")
                    .header("X-API-KEY", key)
                    .json(&json!({"q": query, "num": max_results}))
                    .send()
                    .await
            }
            SearchBackend::SerpApi => {
                let key = self.config.serpapi_api_key.as_deref().unwrap_or_default();
                self.client
                    .get("https://serpapi.com/search")
                    .query(&[("q", query), ("api_key", key), ("engine", "google")])
                    .send()
                    .await
            }
        };

        let resp = payload.map_err(|e| BatonError::Tool {
            tool: WEB_SEARCH_TOOL.into(),
            message: e.to_string(),
        })?;
        if !resp.status().is_success() {
            return Err(BatonError::Tool {
                tool: WEB_SEARCH_TOOL.into(),
                message: format!("{} returned {}", backend.label(), resp.status()),
            });
        }
        let body: Value = resp.json().await.map_err(|e| BatonError::Tool {
            tool: WEB_SEARCH_TOOL.into(),
            message: e.to_string(),
        })?;
        Ok(normalize(backend, query, &body, max_results))
    }
}

#[async_trait]
impl SearchExecutor for WebSearcher {
    async fn search(&self, query: &str, max_results: usize) -> Result<WebSearchResult> {
        let backends = self.backends();
        if backends.is_empty() {
            return Err(BatonError::Tool {
                tool: WEB_SEARCH_TOOL.into(),
                message: "no search backend configured".into(),
            });
        }
        let mut last_err = None;
        for backend in backends {
            debug!(backend = backend.label(), query, "issuing web search");
            match self.search_one(backend, query, max_results).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(backend = backend.label(), error = %e, "search backend failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("at least one backend attempted"))
    }
}

/// Normalize a backend payload into the shared result shape.
pub fn normalize(
    backend: SearchBackend,
    query: &str,
    body: &Value,
    max_results: usize,
) -> WebSearchResult {
    let (rows, title_key, url_key, desc_key, answer) = match backend {
        SearchBackend::Brave => (
            body["web"]["results"].as_array(),
            "title",
            "url",
            "description",
            None,
        ),
        SearchBackend::Tavily => (
            body["results"].as_array(),
            "title",
            "url",
            "content",
            body["answer"].as_str().map(String::from),
        ),
        SearchBackend::Serper => (body["organic"].as_array(), "title", "link", "snippet", None),
        SearchBackend::SerpApi => (
            body["organic_results"].as_array(),
            "title",
            "link",
            "snippet",
            None,
        ),
    };
    let results = rows
        .map(|rows| {
            rows.iter()
                .take(max_results)
                .map(|row| SearchHit {
                    title: row[title_key].as_str().unwrap_or_default().to_string(),
                    url: row[url_key].as_str().unwrap_or_default().to_string(),
                    description: row[desc_key].as_str().unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    WebSearchResult {
        provider: backend.label().to_string(),
        query: query.to_string(),
        results,
        answer,
    }
}
