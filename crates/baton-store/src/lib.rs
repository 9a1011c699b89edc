//! # baton-store
//!
//! The gateway's contract with its persistence collaborators: a typed
//! `(pk, sk)` item store plus views over the shared tables (cost usage,
//! admin limit config, accounts, api keys, model rates, data-source access
//! records, MCP server registry). The gateway never owns this data — it
//! reads, and appends cost charges.

pub mod item;
pub mod tables;

pub use item::{Item, ItemStore, MemoryStore};
pub use tables::{
    ConfiguredLimit, CostRecord, McpServerConfig, TABLE_ACCESS, TABLE_ACCOUNTS, TABLE_ADMIN,
    TABLE_API_KEYS, TABLE_COST, TABLE_GROUPS, TABLE_MCP, TABLE_MODEL_RATES, TABLE_TAGS, Tables,
};
