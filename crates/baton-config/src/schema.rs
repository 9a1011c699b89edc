use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration — maps to `baton.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatonConfig {
    pub server: ServerConfig,
    pub providers: ProvidersConfig,
    pub search: SearchConfig,
    pub retrieval: RetrievalConfig,
    pub registry: RegistryConfig,
    pub limits: LimitsConfig,
    pub logging: LoggingConfig,
}

// ── Server ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, e.g. "0.0.0.0:8787".
    pub listen: String,
    pub cors: bool,
    /// Seconds allowed for request body extraction.
    pub extraction_timeout_secs: u64,
    /// Seconds allowed for the whole routed request.
    pub request_timeout_secs: u64,
    /// Record every stream event and persist the trace per request.
    pub trace_requests: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8787".into(),
            cors: true,
            extraction_timeout_secs: 30,
            request_timeout_secs: 180,
            trace_requests: false,
        }
    }
}

// ── Providers ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openai: Option<OpenAiConfig>,
    pub azure: Option<AzureConfig>,
    pub bedrock: Option<BedrockConfig>,
    pub gemini: Option<GeminiConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub api_key: String,
    /// Resource endpoint, e.g. "https://myresource.openai.azure.com".
    pub endpoint: String,
    pub api_version: String,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: String::new(),
            api_version: "2024-10-21".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BedrockConfig {
    pub region: String,
}

impl Default for BedrockConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
        }
    }
}

// ── Web search ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub brave_api_key: Option<String>,
    pub tavily_api_key: Option<String>,
    pub serper_api_key: Option<String>,
    pub serpapi_api_key: Option<String>,
}

impl SearchConfig {
    /// Whether any search provider is configured (gates the web_search tool).
    pub fn any_configured(&self) -> bool {
        self.brave_api_key.is_some()
            || self.tavily_api_key.is_some()
            || self.serper_api_key.is_some()
            || self.serpapi_api_key.is_some()
    }
}

// ── Retrieval ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Base URL of the embedding retrieval service.
    pub api_base_url: String,
    /// Maximum results per retrieval query.
    pub result_limit: usize,
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            result_limit: 5,
            timeout_secs: 180,
        }
    }
}

// ── Registry ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Path to the versioned alias JSON file.
    pub alias_file: Option<PathBuf>,
}

// ── Limits ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Rolling error-rate threshold that opens a circuit (fraction).
    pub breaker_error_rate: f64,
    /// Estimated cost per hour that opens a circuit (USD).
    pub breaker_cost_per_hour: f64,
    /// Circuit cooldown seconds.
    pub breaker_cooldown_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            breaker_error_rate: 0.2,
            breaker_cost_per_hour: 30.0,
            breaker_cooldown_secs: 300,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info,baton_server=debug".
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            json: false,
        }
    }
}

impl BatonConfig {
    /// Validate the configuration. Returns warnings; hard errors fail.
    pub fn validate(&self) -> std::result::Result<Vec<String>, String> {
        let mut warnings = Vec::new();
        if self.providers.openai.is_none()
            && self.providers.azure.is_none()
            && self.providers.bedrock.is_none()
            && self.providers.gemini.is_none()
        {
            warnings.push("no LLM provider configured — every chat request will fail".into());
        }
        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("server.listen is not an address: {}", self.server.listen));
        }
        if !self.search.any_configured() {
            warnings.push("no web search provider configured — web_search tool disabled".into());
        }
        Ok(warnings)
    }
}
