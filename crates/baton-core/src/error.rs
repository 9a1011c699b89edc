use thiserror::Error;

/// Which configured limit a rejected request ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Admin,
    Group,
    User,
    ProgressiveTimeout,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::Admin => write!(f, "admin"),
            LimitKind::Group => write!(f, "group"),
            LimitKind::User => write!(f, "user"),
            LimitKind::ProgressiveTimeout => write!(f, "progressive_timeout"),
        }
    }
}

/// Structured description of an exceeded rate limit, surfaced in 429 bodies.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LimitExceeded {
    pub kind: LimitKind,
    /// "Hourly", "Daily", "Monthly", "Total" — absent for progressive timeout.
    pub period: Option<String>,
    pub spent: f64,
    pub cap: f64,
}

impl LimitExceeded {
    /// Human-readable body shown to the caller.
    pub fn message(&self) -> String {
        match self.kind {
            LimitKind::ProgressiveTimeout => {
                "Too many requests. You have been placed in a temporary timeout.".to_string()
            }
            kind => {
                let period = self.period.as_deref().unwrap_or("Total");
                let spent_when = match period {
                    "Hourly" => "spent this hour",
                    "Daily" => "spent today",
                    "Monthly" => "spent this month",
                    _ => "spent in total",
                };
                let label = match kind {
                    LimitKind::Admin => "Admin limit",
                    LimitKind::Group => "Group limit",
                    _ => "User limit",
                };
                format!(
                    "Request limit reached. Current Spent: ${:.2} {spent_when} ({label}). Set rate limit: ${:.2} / {period}",
                    self.spent, self.cap
                )
            }
        }
    }
}

/// Unified error type for the entire gateway.
#[derive(Error, Debug)]
pub enum BatonError {
    // ── Request admission ──────────────────────────────────────
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{}", .0.message())]
    RateLimited(LimitExceeded),

    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("circuit open for {function}, retry after {retry_after_secs}s")]
    CircuitOpen {
        function: String,
        retry_after_secs: u64,
    },

    // ── Upstream LLM ───────────────────────────────────────────
    #[error("provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    #[error("context window exceeded on {provider}")]
    ContextOverflow {
        provider: String,
        requested: Option<u64>,
        limit: Option<u64>,
    },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    // ── Tools ──────────────────────────────────────────────────
    #[error("tool call failed: {tool}: {message}")]
    Tool { tool: String, message: String },

    // ── Lifecycle ──────────────────────────────────────────────
    #[error("cancelled")]
    Cancelled,

    // ── Collaborators ──────────────────────────────────────────
    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl BatonError {
    /// HTTP status code this error surfaces as when the stream has not
    /// started yet. Mid-stream, errors become terminal `Error` events instead.
    pub fn status_code(&self) -> u16 {
        match self {
            BatonError::InvalidRequest(_) => 400,
            BatonError::Unauthorized(_) => 401,
            BatonError::RateLimited(_) => 429,
            BatonError::Timeout { .. } => 408,
            BatonError::CircuitOpen { .. } => 503,
            BatonError::ModelNotFound(_) => 400,
            BatonError::Cancelled => 499,
            _ => 500,
        }
    }

    /// Whether the request may be safely retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BatonError::RateLimited(_) | BatonError::Timeout { .. } | BatonError::CircuitOpen { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BatonError>;
