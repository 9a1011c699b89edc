use chrono::{Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use baton_core::{BatonError, LimitKind, LimitPeriod, ModelDescriptor, Principal, Result};

use crate::item::{Item, ItemStore};

pub const TABLE_COST: &str = "cost-usage";
pub const TABLE_ADMIN: &str = "admin-config";
pub const TABLE_GROUPS: &str = "user-groups";
pub const TABLE_ACCOUNTS: &str = "accounts";
pub const TABLE_API_KEYS: &str = "api-keys";
pub const TABLE_MODEL_RATES: &str = "model-rates";
pub const TABLE_ACCESS: &str = "ds-access";
pub const TABLE_TAGS: &str = "ds-tags";
pub const TABLE_MCP: &str = "mcp-servers";

/// A user's running costs for one calendar month.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    /// Cost per UTC wall-clock hour of the current day.
    pub hourly: Vec<f64>,
    /// Cost accumulated today (UTC date).
    pub daily: f64,
    /// UTC date the daily/hourly figures belong to, `YYYY-MM-DD`.
    pub daily_date: String,
    /// Cost accumulated this month.
    pub monthly: f64,
    #[serde(default)]
    pub account_info: Value,
}

impl Default for CostRecord {
    fn default() -> Self {
        Self {
            hourly: vec![0.0; 24],
            daily: 0.0,
            daily_date: String::new(),
            monthly: 0.0,
            account_info: Value::Null,
        }
    }
}

/// A limit configured by an admin, a group policy, or the user themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfiguredLimit {
    pub kind: LimitKind,
    pub period: LimitPeriod,
    pub rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

/// A user-registered remote tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Typed views over the shared store. The gateway owns none of this data —
/// collaborators write it, the gateway reads (and appends cost charges).
#[derive(Clone)]
pub struct Tables {
    store: Arc<dyn ItemStore>,
}

impl Tables {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    // ── Cost usage ─────────────────────────────────────────────

    fn month_key() -> String {
        let now = Utc::now();
        format!("{:04}-{:02}", now.year(), now.month())
    }

    fn day_key() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    /// Current-month cost record for a user. Hour/day figures roll over
    /// automatically when the UTC date has changed since the last charge.
    pub async fn cost_record(&self, user_id: &str) -> Result<CostRecord> {
        let item = self
            .store
            .get(TABLE_COST, user_id, &Self::month_key())
            .await?;
        let mut record: CostRecord = match item {
            Some(item) => serde_json::from_value(item.attributes)?,
            None => CostRecord::default(),
        };
        if record.daily_date != Self::day_key() {
            record.hourly = vec![0.0; 24];
            record.daily = 0.0;
            record.daily_date = Self::day_key();
        }
        Ok(record)
    }

    /// Record a charge against the current UTC hour, day, and month.
    pub async fn add_charge(&self, user_id: &str, amount: f64) -> Result<()> {
        let mut record = self.cost_record(user_id).await?;
        let hour = Utc::now().hour() as usize;
        if record.hourly.len() != 24 {
            record.hourly = vec![0.0; 24];
        }
        record.hourly[hour] += amount;
        record.daily += amount;
        record.monthly += amount;
        self.store
            .put(
                TABLE_COST,
                Item::new(user_id, Self::month_key(), serde_json::to_value(&record)?),
            )
            .await
    }

    /// Lifetime cost: the sum of every monthly record, historical months
    /// included. Computed once per request for "total" limits.
    pub async fn lifetime_cost(&self, user_id: &str) -> Result<f64> {
        let items = self.store.query(TABLE_COST, user_id).await?;
        let mut total = 0.0;
        for item in items {
            if let Some(monthly) = item.attributes.get("monthly").and_then(Value::as_f64) {
                total += monthly;
            }
        }
        Ok(total)
    }

    // ── Admin + group limit config ─────────────────────────────

    pub async fn admin_limits(&self) -> Result<Vec<ConfiguredLimit>> {
        let items = self.store.query(TABLE_ADMIN, "limits").await?;
        let mut limits = Vec::new();
        for item in items {
            let mut limit: ConfiguredLimit = serde_json::from_value(item.attributes)?;
            if let Some(group) = item.sk.strip_prefix("group:") {
                limit.kind = LimitKind::Group;
                limit.group_name = Some(group.to_string());
            }
            limits.push(limit);
        }
        Ok(limits)
    }

    pub async fn user_groups(&self, user_id: &str) -> Result<Vec<String>> {
        let items = self.store.query(TABLE_GROUPS, user_id).await?;
        Ok(items.into_iter().map(|i| i.sk).collect())
    }

    // ── Accounts / API keys ────────────────────────────────────

    pub async fn account(&self, account_id: &str) -> Result<Option<Value>> {
        Ok(self
            .store
            .get(TABLE_ACCOUNTS, account_id, "info")
            .await?
            .map(|i| i.attributes))
    }

    /// Resolve a bearer token to a verified principal.
    pub async fn principal_for_token(&self, token: &str) -> Result<Principal> {
        let item = self
            .store
            .get(TABLE_API_KEYS, token, "key")
            .await?
            .ok_or_else(|| BatonError::Unauthorized("unknown access token".into()))?;
        let user_id = item.attributes["user_id"]
            .as_str()
            .ok_or_else(|| BatonError::Store("api key record missing user_id".into()))?
            .to_string();
        Ok(Principal {
            user_id,
            access_token: token.to_string(),
            api_key_id: item.attributes["api_key_id"].as_str().map(String::from),
            account_id: item.attributes["account_id"].as_str().map(String::from),
        })
    }

    // ── Model rates ────────────────────────────────────────────

    pub async fn model_descriptors(&self) -> Result<Vec<ModelDescriptor>> {
        let items = self.store.query(TABLE_MODEL_RATES, "models").await?;
        let mut models = Vec::with_capacity(items.len());
        for item in items {
            models.push(serde_json::from_value(item.attributes)?);
        }
        Ok(models)
    }

    pub async fn put_model(&self, model: &ModelDescriptor) -> Result<()> {
        self.store
            .put(
                TABLE_MODEL_RATES,
                Item::new("models", model.id.clone(), serde_json::to_value(model)?),
            )
            .await
    }

    // ── Data-source access records ─────────────────────────────

    /// True when `principal_key` (a user id, `group:<name>`, or
    /// `assistant:<id>`) holds an explicit access record for the source.
    pub async fn has_access(&self, ds_id: &str, principal_key: &str) -> Result<bool> {
        Ok(self.store.get(TABLE_ACCESS, ds_id, principal_key).await?.is_some())
    }

    pub async fn grant_access(&self, ds_id: &str, principal_key: &str) -> Result<()> {
        self.store
            .put(TABLE_ACCESS, Item::new(ds_id, principal_key, json!({})))
            .await
    }

    /// Concrete data-source ids behind a user's tag.
    pub async fn expand_tag(&self, user_id: &str, tag: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .get(TABLE_TAGS, user_id, tag)
            .await?
            .and_then(|item| {
                item.attributes
                    .get("ids")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
            })
            .unwrap_or_default())
    }

    // ── MCP server registry ────────────────────────────────────

    pub async fn mcp_servers(&self, user_id: &str) -> Result<Vec<McpServerConfig>> {
        let items = self.store.query(TABLE_MCP, user_id).await?;
        let mut servers = Vec::new();
        for item in items {
            let mut cfg: McpServerConfig = serde_json::from_value(item.attributes)?;
            cfg.name = item.sk;
            servers.push(cfg);
        }
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::MemoryStore;

    fn tables() -> Tables {
        Tables::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_add_charge_accumulates() {
        let t = tables();
        t.add_charge("u@x.com", 0.5).await.unwrap();
        t.add_charge("u@x.com", 0.25).await.unwrap();
        let record = t.cost_record("u@x.com").await.unwrap();
        assert!((record.daily - 0.75).abs() < 1e-9);
        assert!((record.monthly - 0.75).abs() < 1e-9);
        let hour = Utc::now().hour() as usize;
        assert!((record.hourly[hour] - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_lifetime_cost_sums_months() {
        let t = tables();
        // A historical month written by a collaborator.
        t.store()
            .put(
                TABLE_COST,
                Item::new("u@x.com", "2025-01", json!({"monthly": 4.0})),
            )
            .await
            .unwrap();
        t.add_charge("u@x.com", 1.0).await.unwrap();
        let total = t.lifetime_cost("u@x.com").await.unwrap();
        assert!((total - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_admin_and_group_limits() {
        let t = tables();
        t.store()
            .put(
                TABLE_ADMIN,
                Item::new(
                    "limits",
                    "admin",
                    json!({"kind": "admin", "period": "daily", "rate": 10.0}),
                ),
            )
            .await
            .unwrap();
        t.store()
            .put(
                TABLE_ADMIN,
                Item::new(
                    "limits",
                    "group:research",
                    json!({"kind": "group", "period": "monthly", "rate": 100.0}),
                ),
            )
            .await
            .unwrap();
        let limits = t.admin_limits().await.unwrap();
        assert_eq!(limits.len(), 2);
        let group = limits.iter().find(|l| l.kind == LimitKind::Group).unwrap();
        assert_eq!(group.group_name.as_deref(), Some("research"));
    }

    #[tokio::test]
    async fn test_principal_for_unknown_token_fails() {
        let t = tables();
        let err = t.principal_for_token("nope").await.unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn test_access_records() {
        let t = tables();
        assert!(!t.has_access("s3://a@x.com/f", "b@x.com").await.unwrap());
        t.grant_access("s3://a@x.com/f", "b@x.com").await.unwrap();
        assert!(t.has_access("s3://a@x.com/f", "b@x.com").await.unwrap());
    }
}
