use tracing::debug;

use baton_core::{BatonError, DataSource, Principal, Result};
use baton_store::Tables;

/// The outcome of resolving a request's data sources: every id verified,
/// partitioned by how the strategies consume them.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSources {
    pub texts: Vec<DataSource>,
    pub images: Vec<DataSource>,
    /// Shared group / assistant sources (retrieved with separate scoping).
    pub group: Vec<DataSource>,
    /// AST-annotated sources for structured retrieval.
    pub ast: Vec<DataSource>,
    /// `obj://` references bound later to workflow slots.
    pub objects: Vec<DataSource>,
}

impl ResolvedSources {
    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
            && self.images.is_empty()
            && self.group.is_empty()
            && self.ast.is_empty()
            && self.objects.is_empty()
    }

    /// Sources that participate in retrieval queries.
    pub fn retrievable(&self) -> usize {
        self.texts.len() + self.group.len() + self.ast.len()
    }
}

/// Validates access to every referenced data source and partitions the set.
#[derive(Clone)]
pub struct SourceResolver {
    tables: Tables,
}

impl SourceResolver {
    pub fn new(tables: Tables) -> Self {
        Self { tables }
    }

    /// Resolve the request's source references.
    ///
    /// For every id the caller must be the owner, or hold an explicit access
    /// record directly, through one of their groups, or through the declared
    /// assistant. Any failure rejects the whole request with 401.
    pub async fn resolve(
        &self,
        principal: &Principal,
        sources: &[DataSource],
        image_sources: &[DataSource],
        assistant_id: Option<&str>,
    ) -> Result<ResolvedSources> {
        let mut resolved = ResolvedSources::default();

        let expanded = self.expand_tags(principal, sources).await?;
        for source in &expanded {
            if source.is_object_ref() {
                // Workflow intermediates exist only inside this request.
                resolved.objects.push(source.clone());
                continue;
            }
            self.assert_access(principal, source, assistant_id).await?;
            if source.is_image() {
                resolved.images.push(source.clone());
            } else if source.ast.is_some() {
                resolved.ast.push(source.clone());
            } else if source.group_id.is_some() {
                resolved.group.push(source.clone());
            } else {
                resolved.texts.push(source.clone());
            }
        }

        for source in image_sources {
            self.assert_access(principal, source, assistant_id).await?;
            resolved.images.push(source.clone());
        }

        debug!(
            texts = resolved.texts.len(),
            images = resolved.images.len(),
            group = resolved.group.len(),
            ast = resolved.ast.len(),
            objects = resolved.objects.len(),
            "resolved data sources"
        );
        Ok(resolved)
    }

    /// Expand `tag://` references into the concrete ids they name.
    async fn expand_tags(
        &self,
        principal: &Principal,
        sources: &[DataSource],
    ) -> Result<Vec<DataSource>> {
        let mut out = Vec::with_capacity(sources.len());
        for source in sources {
            if source.scheme() == Some("tag") {
                let Some(tag) = source.key().or_else(|| source.owner()) else {
                    return Err(BatonError::InvalidRequest(format!(
                        "malformed tag reference: {}",
                        source.id
                    )));
                };
                for id in self.tables.expand_tag(&principal.user_id, tag).await? {
                    let mut ds = DataSource::new(id);
                    ds.kind = source.kind.clone();
                    out.push(ds);
                }
            } else {
                out.push(source.clone());
            }
        }
        Ok(out)
    }

    async fn assert_access(
        &self,
        principal: &Principal,
        source: &DataSource,
        assistant_id: Option<&str>,
    ) -> Result<()> {
        // Ownership is proven by the id itself.
        if source.owner() == Some(principal.user_id.as_str()) {
            return Ok(());
        }
        // Directly shared with the user.
        if self.tables.has_access(&source.id, &principal.user_id).await? {
            return Ok(());
        }
        // Shared with a group the user belongs to.
        if let Some(group_id) = &source.group_id {
            let groups = self.tables.user_groups(&principal.user_id).await?;
            if groups.iter().any(|g| g == group_id)
                && self
                    .tables
                    .has_access(&source.id, &format!("group:{group_id}"))
                    .await?
            {
                return Ok(());
            }
        }
        // Attached to the assistant handling this request.
        if let Some(assistant_id) = assistant_id
            && self
                .tables
                .has_access(&source.id, &format!("assistant:{assistant_id}"))
                .await?
        {
            return Ok(());
        }
        Err(BatonError::Unauthorized(format!(
            "no access to data source {}",
            source.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_store::{Item, MemoryStore, TABLE_GROUPS, TABLE_TAGS};
    use serde_json::json;
    use std::sync::Arc;

    fn principal() -> Principal {
        Principal::new("alice@x.com", "tok")
    }

    fn resolver() -> SourceResolver {
        SourceResolver::new(Tables::new(Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn test_owner_always_allowed() {
        let r = resolver();
        let sources = vec![DataSource::new("s3://alice@x.com/notes.txt")];
        let resolved = r.resolve(&principal(), &sources, &[], None).await.unwrap();
        assert_eq!(resolved.texts.len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_source_without_record_rejected() {
        let r = resolver();
        let sources = vec![DataSource::new("s3://bob@x.com/secret.txt")];
        let err = r.resolve(&principal(), &sources, &[], None).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn test_shared_source_allowed() {
        let r = resolver();
        r.tables
            .grant_access("s3://bob@x.com/shared.txt", "alice@x.com")
            .await
            .unwrap();
        let sources = vec![DataSource::new("s3://bob@x.com/shared.txt")];
        let resolved = r.resolve(&principal(), &sources, &[], None).await.unwrap();
        assert_eq!(resolved.texts.len(), 1);
    }

    #[tokio::test]
    async fn test_group_source_requires_membership_and_record() {
        let r = resolver();
        let mut ds = DataSource::new("s3://bob@x.com/team.txt");
        ds.group_id = Some("research".into());
        r.tables
            .grant_access("s3://bob@x.com/team.txt", "group:research")
            .await
            .unwrap();

        // Not a member yet.
        let err = r
            .resolve(&principal(), &[ds.clone()], &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);

        r.tables
            .store()
            .put(TABLE_GROUPS, Item::new("alice@x.com", "research", json!({})))
            .await
            .unwrap();
        let resolved = r.resolve(&principal(), &[ds], &[], None).await.unwrap();
        assert_eq!(resolved.group.len(), 1);
    }

    #[tokio::test]
    async fn test_assistant_source_allowed_with_record() {
        let r = resolver();
        r.tables
            .grant_access("s3://bob@x.com/kb.txt", "assistant:ast-1")
            .await
            .unwrap();
        let sources = vec![DataSource::new("s3://bob@x.com/kb.txt")];
        assert!(r.resolve(&principal(), &sources, &[], None).await.is_err());
        let resolved = r
            .resolve(&principal(), &sources, &[], Some("ast-1"))
            .await
            .unwrap();
        assert_eq!(resolved.texts.len(), 1);
    }

    #[tokio::test]
    async fn test_object_refs_skip_access_checks() {
        let r = resolver();
        let sources = vec![DataSource::new("obj://step_output")];
        let resolved = r.resolve(&principal(), &sources, &[], None).await.unwrap();
        assert_eq!(resolved.objects.len(), 1);
    }

    #[tokio::test]
    async fn test_tag_expansion() {
        let r = resolver();
        r.tables
            .store()
            .put(
                TABLE_TAGS,
                Item::new(
                    "alice@x.com",
                    "reports",
                    json!({"ids": ["s3://alice@x.com/q1.txt", "s3://alice@x.com/q2.txt"]}),
                ),
            )
            .await
            .unwrap();
        let sources = vec![DataSource::new("tag://reports")];
        let resolved = r.resolve(&principal(), &sources, &[], None).await.unwrap();
        assert_eq!(resolved.texts.len(), 2);
    }

    #[tokio::test]
    async fn test_image_partitioning() {
        let r = resolver();
        let mut ds = DataSource::new("s3://alice@x.com/photo.png");
        ds.metadata = json!({"contentType": "image/png"});
        let resolved = r.resolve(&principal(), &[ds], &[], None).await.unwrap();
        assert_eq!(resolved.images.len(), 1);
        assert!(resolved.texts.is_empty());
    }
}
