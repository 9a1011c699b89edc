use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A verified user identity, created at gateway entry and immutable for the
/// lifetime of the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
            api_key_id: None,
            account_id: None,
        }
    }
}

/// Upstream LLM vendor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Azure,
    Bedrock,
    Gemini,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Azure => write!(f, "azure"),
            ProviderKind::Bedrock => write!(f, "bedrock"),
            ProviderKind::Gemini => write!(f, "gemini"),
        }
    }
}

/// A concrete model known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub provider: ProviderKind,
    pub context_window: usize,
    pub output_token_limit: usize,
    #[serde(default)]
    pub supports_images: bool,
    #[serde(default = "default_true")]
    pub supports_system_prompts: bool,
    #[serde(default)]
    pub supports_reasoning: bool,
    /// Appended to the system prompt whenever this model is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_suffix: Option<String>,
    /// Maximum images attached per request.
    #[serde(default = "default_image_limit")]
    pub image_limit: usize,
    /// USD per input token, used for cheapest-equivalent selection.
    #[serde(default)]
    pub input_rate: f64,
    /// USD per output token.
    #[serde(default)]
    pub output_rate: f64,
}

fn default_true() -> bool {
    true
}

fn default_image_limit() -> usize {
    10
}

impl ModelDescriptor {
    /// Whether the Anthropic message conventions apply (RAG context is
    /// prepended to the last user message rather than inserted before it).
    pub fn is_anthropic(&self) -> bool {
        self.id.contains("anthropic") || self.id.contains("claude")
    }
}

/// Display metadata attached to an alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasInfo {
    pub resolves_to: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub description: String,
}

/// Scheme used for workflow-intermediate values.
pub const OBJECT_SCHEME: &str = "obj";

/// A reference to a blob of grounding material: `<scheme>://<owner>/<key>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ast: Option<Value>,
}

impl DataSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: String::new(),
            metadata: Value::Null,
            group_id: None,
            ast: None,
        }
    }

    pub fn scheme(&self) -> Option<&str> {
        self.id.split_once("://").map(|(s, _)| s)
    }

    pub fn owner(&self) -> Option<&str> {
        extract_owner(&self.id)
    }

    /// Key part after the owner segment.
    pub fn key(&self) -> Option<&str> {
        let (_, rest) = self.id.split_once("://")?;
        rest.split_once('/').map(|(_, k)| k)
    }

    /// Whether this names a workflow-intermediate value (`obj://<slot>`).
    pub fn is_object_ref(&self) -> bool {
        self.scheme() == Some(OBJECT_SCHEME)
    }

    /// Slot name for an `obj://` reference.
    pub fn object_name(&self) -> Option<&str> {
        if !self.is_object_ref() {
            return None;
        }
        self.id.split_once("://").map(|(_, rest)| rest)
    }

    pub fn is_image(&self) -> bool {
        self.kind.starts_with("image/")
            || self
                .metadata
                .get("contentType")
                .and_then(|v| v.as_str())
                .is_some_and(|t| t.starts_with("image/"))
    }
}

/// Owner segment of a data source id, if the id is well-formed.
pub fn extract_owner(id: &str) -> Option<&str> {
    let (_, rest) = id.split_once("://")?;
    let owner = rest.split('/').next()?;
    if owner.is_empty() { None } else { Some(owner) }
}

/// Cost-limit period for admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitPeriod {
    Hourly,
    Daily,
    Monthly,
    Total,
    Unlimited,
}

impl LimitPeriod {
    pub fn label(&self) -> &'static str {
        match self {
            LimitPeriod::Hourly => "Hourly",
            LimitPeriod::Daily => "Daily",
            LimitPeriod::Monthly => "Monthly",
            LimitPeriod::Total => "Total",
            LimitPeriod::Unlimited => "Unlimited",
        }
    }
}

/// A single configured cost limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub period: LimitPeriod,
    /// USD cap for the period. Ignored for `Unlimited`.
    #[serde(default)]
    pub rate: f64,
}

impl RateLimit {
    pub fn unlimited() -> Self {
        Self {
            period: LimitPeriod::Unlimited,
            rate: 0.0,
        }
    }
}
