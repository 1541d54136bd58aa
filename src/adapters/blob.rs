//! Content-addressed blob store on the local filesystem.
//!
//! Blobs are stored as `<root>/<sha256>.<ext>` and addressed by `file://`
//! URLs. Writing the same bytes twice yields the same URL.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;

use super::BlobStore;

/// Filesystem-backed blob store
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Open a store rooted at `root` (created on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for_url(&self, url: &str) -> Result<PathBuf> {
        let path = url
            .strip_prefix("file://")
            .with_context(|| format!("Unsupported blob URL: {}", url))?;
        let path = PathBuf::from(path);

        if !path.starts_with(&self.root) {
            anyhow::bail!("Blob URL outside of store root: {}", url);
        }
        Ok(path)
    }
}

/// File extension for a content type
fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "application/json" => "json",
        "text/markdown" => "md",
        _ => "bin",
    }
}

/// Hex SHA-256 of the content
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, bytes: &[u8], content_type: &str) -> Result<String> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create blob directory: {}", self.root.display()))?;

        let file_name = format!("{}.{}", content_digest(bytes), extension_for(content_type));
        let path = self.root.join(file_name);

        if !path.exists() {
            fs::write(&path, bytes)
                .await
                .with_context(|| format!("Failed to write blob: {}", path.display()))?;
        }

        Ok(format!("file://{}", path.display()))
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let path = self.path_for_url(url)?;
        fs::read(&path)
            .await
            .with_context(|| format!("Failed to read blob: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_is_content_addressed() {
        let temp = TempDir::new().unwrap();
        let store = FileBlobStore::new(temp.path().join("blobs"));

        let url1 = store.put(b"png bytes", "image/png").await.unwrap();
        let url2 = store.put(b"png bytes", "image/png").await.unwrap();
        assert_eq!(url1, url2);
        assert!(url1.ends_with(".png"));

        let bytes = store.get(&url1).await.unwrap();
        assert_eq!(bytes, b"png bytes");
    }

    #[tokio::test]
    async fn test_rejects_foreign_urls() {
        let temp = TempDir::new().unwrap();
        let store = FileBlobStore::new(temp.path().join("blobs"));

        assert!(store.get("https://example.com/a.png").await.is_err());
        assert!(store.get("file:///etc/passwd").await.is_err());
    }

    #[test]
    fn test_digest_length() {
        assert_eq!(content_digest(b"abc").len(), 64);
    }
}
