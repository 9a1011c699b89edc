use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use baton_core::{AliasInfo, BatonError, Result};

/// On-disk alias file: versioned JSON loaded once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AliasFile {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub aliases: HashMap<String, AliasInfo>,
}

/// Result of resolving a model name.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub resolved_id: String,
    pub was_alias: bool,
    pub alias_info: Option<AliasInfo>,
}

/// In-memory alias map. Lookup is O(1); unknown and empty names pass
/// through unchanged.
#[derive(Debug, Clone, Default)]
pub struct AliasRegistry {
    aliases: HashMap<String, AliasInfo>,
}

impl AliasRegistry {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: AliasFile = serde_json::from_str(&raw)
            .map_err(|e| BatonError::Config(format!("bad alias file {}: {e}", path.display())))?;
        info!(
            version = file.version,
            count = file.aliases.len(),
            "loaded model aliases"
        );
        Ok(Self {
            aliases: file.aliases,
        })
    }

    pub fn from_map(aliases: HashMap<String, AliasInfo>) -> Self {
        Self { aliases }
    }

    pub fn resolve(&self, name: &str) -> Resolution {
        match self.aliases.get(name) {
            Some(info) => Resolution {
                resolved_id: info.resolves_to.clone(),
                was_alias: true,
                alias_info: Some(info.clone()),
            },
            None => Resolution {
                resolved_id: name.to_string(),
                was_alias: false,
                alias_info: None,
            },
        }
    }

    pub fn all(&self) -> &HashMap<String, AliasInfo> {
        &self.aliases
    }
}
