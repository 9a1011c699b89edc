use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use baton_core::ProviderKind;
use baton_flow::AssistantRouter;
use baton_limits::{BreakerConfig, BreakerRegistry, RateLimiter};
use baton_llm::LlmClient;
use baton_providers::{BedrockProvider, GeminiProvider, OpenAiFamilyProvider, Provider};
use baton_registry::{AliasRegistry, ModelCatalog};
use baton_server::{Gateway, Metrics, RequestRegistry, start_server};
use baton_sources::{RagClient, SourceResolver};
use baton_store::{MemoryStore, Tables};
use baton_tools::{McpRegistry, WebSearcher};

#[derive(Parser)]
#[command(name = "baton", version, about = "LLM request gateway and streaming orchestrator")]
struct Cli {
    /// Path to baton.toml (defaults to ~/.baton/baton.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default).
    Serve,
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = baton_config::load(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.filter.clone()));
    if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::CheckConfig => {
            info!("configuration OK");
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: baton_config::BatonConfig) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let tables = Tables::new(store);

    let mut llm = LlmClient::new();
    if let Some(openai) = &config.providers.openai {
        let provider = OpenAiFamilyProvider::openai(openai.api_key.clone(), openai.base_url.clone());
        llm = llm.with_provider(ProviderKind::OpenAi, Arc::new(provider) as Arc<dyn Provider>);
    }
    if let Some(azure) = &config.providers.azure {
        let provider = OpenAiFamilyProvider::azure(
            azure.api_key.clone(),
            azure.endpoint.clone(),
            azure.api_version.clone(),
        );
        llm = llm.with_provider(ProviderKind::Azure, Arc::new(provider) as Arc<dyn Provider>);
    }
    if let Some(bedrock) = &config.providers.bedrock {
        let provider = BedrockProvider::new(bedrock.region.clone()).await;
        llm = llm.with_provider(ProviderKind::Bedrock, Arc::new(provider) as Arc<dyn Provider>);
    }
    if let Some(gemini) = &config.providers.gemini {
        let provider = GeminiProvider::new(gemini.api_key.clone(), gemini.base_url.clone());
        llm = llm.with_provider(ProviderKind::Gemini, Arc::new(provider) as Arc<dyn Provider>);
    }

    let aliases = match &config.registry.alias_file {
        Some(path) => AliasRegistry::from_file(path)?,
        None => {
            warn!("no alias file configured, model names pass through unchanged");
            AliasRegistry::default()
        }
    };

    let rag = (!config.retrieval.api_base_url.is_empty())
        .then(|| RagClient::new(config.retrieval.clone()));
    let search = config
        .search
        .any_configured()
        .then(|| Arc::new(WebSearcher::new(config.search.clone())));

    let breakers = BreakerRegistry::new(BreakerConfig {
        error_rate: config.limits.breaker_error_rate,
        cost_per_hour: config.limits.breaker_cost_per_hour,
        cooldown: std::time::Duration::from_secs(config.limits.breaker_cooldown_secs),
    });

    let gateway = Arc::new(Gateway {
        limiter: RateLimiter::new(tables.clone()),
        breakers,
        aliases,
        catalog: ModelCatalog::new(tables.clone()),
        llm: Arc::new(llm),
        resolver: SourceResolver::new(tables.clone()),
        rag,
        search,
        mcp: Arc::new(McpRegistry::new(tables.clone())),
        router: AssistantRouter::new(),
        requests: RequestRegistry::new(),
        metrics: Metrics::new(),
        tables,
        config,
    });

    start_server(gateway).await?;
    Ok(())
}
