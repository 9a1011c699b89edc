//! # baton-registry
//!
//! Alias resolution (name → concrete model id, loaded once from a versioned
//! JSON file) and the per-user model catalog with cheapest-equivalent
//! selection.

pub mod alias;
pub mod catalog;

pub use alias::{AliasFile, AliasRegistry, Resolution};
pub use catalog::{ModelCatalog, UserModels};
