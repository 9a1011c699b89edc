use serde::Serialize;
use std::collections::HashMap;

use baton_core::{BatonError, ModelDescriptor, Principal, Result};
use baton_store::{TABLE_ADMIN, Tables};

/// The model catalog available to one user.
#[derive(Debug, Clone, Serialize)]
pub struct UserModels {
    pub models_by_id: HashMap<String, ModelDescriptor>,
    /// Cheapest permitted model (utility sub-calls default to it).
    pub cheapest: Option<String>,
    /// Most capable permitted model.
    pub advanced: Option<String>,
    /// Model used for cached document extraction.
    pub document_caching: Option<String>,
}

impl UserModels {
    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models_by_id.get(id)
    }

    pub fn require(&self, id: &str) -> Result<&ModelDescriptor> {
        self.get(id)
            .ok_or_else(|| BatonError::ModelNotFound(id.to_string()))
    }

    /// The permitted model with the same capability flags as `model` and the
    /// lowest per-token rate. Falls back to `model` itself when nothing
    /// cheaper matches.
    pub fn cheapest_equivalent<'a>(&'a self, model: &'a ModelDescriptor) -> &'a ModelDescriptor {
        self.models_by_id
            .values()
            .filter(|m| {
                m.supports_images == model.supports_images
                    && m.supports_reasoning == model.supports_reasoning
            })
            .min_by(|a, b| {
                a.input_rate
                    .partial_cmp(&b.input_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(model)
    }
}

/// Reads the model-rates table and computes the per-user catalog.
#[derive(Clone)]
pub struct ModelCatalog {
    tables: Tables,
}

impl ModelCatalog {
    pub fn new(tables: Tables) -> Self {
        Self { tables }
    }

    /// Models the user may call, with the cheapest/advanced/document-caching
    /// picks. Admin records may restrict the id set per user; absent a
    /// restriction, every registered model is permitted.
    pub async fn user_available_models(&self, principal: &Principal) -> Result<UserModels> {
        let all = self.tables.model_descriptors().await?;

        let allowed: Option<Vec<String>> = self
            .tables
            .store()
            .get(TABLE_ADMIN, "model-access", &principal.user_id)
            .await?
            .and_then(|item| {
                item.attributes
                    .get("allowed")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
            });

        let models_by_id: HashMap<String, ModelDescriptor> = all
            .into_iter()
            .filter(|m| match &allowed {
                Some(ids) => ids.iter().any(|id| id == &m.id),
                None => true,
            })
            .map(|m| (m.id.clone(), m))
            .collect();

        let cheapest = models_by_id
            .values()
            .min_by(|a, b| {
                a.input_rate
                    .partial_cmp(&b.input_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|m| m.id.clone());

        let advanced = models_by_id
            .values()
            .filter(|m| m.supports_reasoning)
            .max_by(|a, b| {
                a.input_rate
                    .partial_cmp(&b.input_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|m| m.id.clone())
            .or_else(|| cheapest.clone());

        // Admin may pin the document-caching model; otherwise the cheapest
        // large-context model serves.
        let document_caching = self
            .tables
            .store()
            .get(TABLE_ADMIN, "models", "defaults")
            .await?
            .and_then(|item| {
                item.attributes
                    .get("document_caching")
                    .and_then(|v| v.as_str())
                    .map(String::from)
            })
            .or_else(|| {
                models_by_id
                    .values()
                    .filter(|m| m.context_window >= 100_000)
                    .min_by(|a, b| {
                        a.input_rate
                            .partial_cmp(&b.input_rate)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|m| m.id.clone())
            });

        Ok(UserModels {
            models_by_id,
            cheapest,
            advanced,
            document_caching,
        })
    }
}
