use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub key: String,
    pub url: String,
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn upload_file(&self, bytes: &[u8], name: &str) -> anyhow::Result<StoredFile>;

    /// Deterministic per key, so repeated calls hand back the same URL.
    async fn get_signed_url(&self, key: &str) -> anyhow::Result<String>;

    async fn delete_file(&self, key: &str) -> anyhow::Result<()>;
}

/// Returns plausible keys and URLs without persisting a single byte.
pub struct MockStorageProvider;

#[async_trait]
impl StorageProvider for MockStorageProvider {
    async fn upload_file(&self, bytes: &[u8], name: &str) -> anyhow::Result<StoredFile> {
        let key = format!("mock/{}/{name}", uuid::Uuid::new_v4());
        debug!("mock upload of {} bytes as {key}", bytes.len());
        Ok(StoredFile {
            url: format!("https://storage.preview.invalid/{key}"),
            key,
        })
    }

    async fn get_signed_url(&self, key: &str) -> anyhow::Result<String> {
        Ok(format!(
            "https://storage.preview.invalid/{key}?signature=mock&expires=never"
        ))
    }

    async fn delete_file(&self, key: &str) -> anyhow::Result<()> {
        debug!("mock delete of {key}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_returns_url_without_persisting() {
        let provider = MockStorageProvider;
        let stored = provider.upload_file(b"hello", "report.pdf").await.unwrap();
        assert!(stored.key.ends_with("/report.pdf"));
        assert!(stored.url.contains(&stored.key));
    }

    #[tokio::test]
    async fn signed_urls_are_deterministic() {
        let provider = MockStorageProvider;
        let a = provider.get_signed_url("mock/abc/x.png").await.unwrap();
        let b = provider.get_signed_url("mock/abc/x.png").await.unwrap();
        assert_eq!(a, b);
        provider.delete_file("mock/abc/x.png").await.unwrap();
    }
}
