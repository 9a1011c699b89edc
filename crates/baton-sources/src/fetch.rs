use async_trait::async_trait;

use baton_core::{BatonError, Blob, BlobFetcher, DataSource, Result};

/// Fetches blob content from the document-storage collaborator over HTTP.
/// The storage service resolves `<scheme>://<owner>/<key>` ids itself; this
/// client only relays them with the service credential.
pub struct HttpBlobFetcher {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl HttpBlobFetcher {
    pub fn new(base_url: String, access_token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            access_token,
        }
    }
}

#[async_trait]
impl BlobFetcher for HttpBlobFetcher {
    async fn fetch(&self, source: &DataSource) -> Result<Blob> {
        let url = format!("{}/content", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[("id", source.id.as_str())])
            .send()
            .await
            .map_err(|e| BatonError::Internal(format!("content fetch failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(BatonError::Store(format!(
                "content fetch for {} returned {}",
                source.id,
                resp.status()
            )));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| BatonError::Internal(format!("content read failed: {e}")))?;
        Ok(Blob {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}
