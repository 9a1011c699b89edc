//! # baton-config
//!
//! Configuration for the gateway (`baton.toml`): provider endpoints and
//! credentials, web-search keys, the retrieval service, alias file location,
//! server timeouts, and breaker tunables.

pub mod loader;
pub mod schema;

pub use loader::{load, resolve_path};
pub use schema::{
    AzureConfig, BatonConfig, BedrockConfig, GeminiConfig, LimitsConfig, LoggingConfig,
    OpenAiConfig, ProvidersConfig, RegistryConfig, RetrievalConfig, SearchConfig, ServerConfig,
};
