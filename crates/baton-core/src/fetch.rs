use async_trait::async_trait;

use crate::error::Result;
use crate::types::DataSource;

/// Fetched blob content.
#[derive(Debug, Clone)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl Blob {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Access to data-source content. The document store is an external
/// collaborator; the gateway only reads through this interface.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch(&self, source: &DataSource) -> Result<Blob>;
}
