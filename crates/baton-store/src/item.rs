use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use baton_core::Result;

/// A single stored item. The core treats attribute contents as opaque JSON;
/// typed views live in [`crate::tables`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub pk: String,
    pub sk: String,
    pub attributes: Value,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>, attributes: Value) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
            attributes,
            updated_at: Utc::now(),
        }
    }
}

/// Key-value plus indexed queries over `(pk, sk)` items — the only contract
/// the gateway has with its persistence collaborators.
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn get(&self, table: &str, pk: &str, sk: &str) -> Result<Option<Item>>;
    async fn put(&self, table: &str, item: Item) -> Result<()>;
    /// All items under a partition key, ordered by sort key.
    async fn query(&self, table: &str, pk: &str) -> Result<Vec<Item>>;
    async fn delete(&self, table: &str, pk: &str, sk: &str) -> Result<()>;
}

type TableMap = BTreeMap<(String, String), Item>;

/// In-memory store used in tests and single-node deployments.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<BTreeMap<String, TableMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn get(&self, table: &str, pk: &str, sk: &str) -> Result<Option<Item>> {
        let tables = self.tables.read();
        Ok(tables
            .get(table)
            .and_then(|t| t.get(&(pk.to_string(), sk.to_string())))
            .cloned())
    }

    async fn put(&self, table: &str, item: Item) -> Result<()> {
        let mut tables = self.tables.write();
        tables
            .entry(table.to_string())
            .or_default()
            .insert((item.pk.clone(), item.sk.clone()), item);
        Ok(())
    }

    async fn query(&self, table: &str, pk: &str) -> Result<Vec<Item>> {
        let tables = self.tables.read();
        Ok(tables
            .get(table)
            .map(|t| {
                t.range((pk.to_string(), String::new())..)
                    .take_while(|((p, _), _)| p == pk)
                    .map(|(_, item)| item.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, table: &str, pk: &str, sk: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(t) = tables.get_mut(table) {
            t.remove(&(pk.to_string(), sk.to_string()));
        }
        Ok(())
    }
}
