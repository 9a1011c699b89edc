use std::path::{Path, PathBuf};
use tracing::{info, warn};

use baton_core::{BatonError, Result};

use crate::schema::BatonConfig;

/// Resolve the config path: explicit path > BATON_CONFIG env > ~/.baton/baton.toml
pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Ok(p) = std::env::var("BATON_CONFIG") {
        return PathBuf::from(p);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".baton")
        .join("baton.toml")
}

/// Load the config from disk, falling back to defaults, then apply
/// environment overrides and validate.
pub fn load(path: Option<&Path>) -> Result<BatonConfig> {
    let config_path = resolve_path(path);
    let config = if config_path.exists() {
        info!(?config_path, "loading configuration");
        let raw = std::fs::read_to_string(&config_path)?;
        toml::from_str::<BatonConfig>(&raw).map_err(|e| {
            BatonError::Config(format!("failed to parse {}: {}", config_path.display(), e))
        })?
    } else {
        warn!(?config_path, "config file not found, using defaults");
        BatonConfig::default()
    };

    let config = apply_env_overrides(config);

    match config.validate() {
        Ok(warnings) => {
            for w in &warnings {
                warn!("{}", w);
            }
        }
        Err(e) => return Err(BatonError::Config(e)),
    }

    Ok(config)
}

/// Credentials may come from the environment instead of the file.
fn apply_env_overrides(mut config: BatonConfig) -> BatonConfig {
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        config.providers.openai.get_or_insert_with(Default::default).api_key = key;
    }
    if let Ok(key) = std::env::var("AZURE_OPENAI_API_KEY") {
        config.providers.azure.get_or_insert_with(Default::default).api_key = key;
    }
    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        config.providers.gemini.get_or_insert_with(Default::default).api_key = key;
    }
    if let Ok(key) = std::env::var("BRAVE_API_KEY") {
        config.search.brave_api_key = Some(key);
    }
    if let Ok(key) = std::env::var("TAVILY_API_KEY") {
        config.search.tavily_api_key = Some(key);
    }
    if let Ok(key) = std::env::var("SERPER_API_KEY") {
        config.search.serper_api_key = Some(key);
    }
    if let Ok(key) = std::env::var("SERPAPI_API_KEY") {
        config.search.serpapi_api_key = Some(key);
    }
    if let Ok(url) = std::env::var("API_BASE_URL") {
        config.retrieval.api_base_url = url;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(cfg.server.request_timeout_secs, 180);
        assert_eq!(cfg.server.extraction_timeout_secs, 30);
    }

    #[test]
    fn test_load_parses_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baton.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[server]\nlisten = \"127.0.0.1:9000\"\n\n[search]\nbrave_api_key = \"k\"\n"
        )
        .unwrap();
        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.server.listen, "127.0.0.1:9000");
        assert!(cfg.search.any_configured());
    }

    #[test]
    fn test_bad_listen_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baton.toml");
        std::fs::write(&path, "[server]\nlisten = \"not-an-addr\"\n").unwrap();
        assert!(load(Some(&path)).is_err());
    }
}
