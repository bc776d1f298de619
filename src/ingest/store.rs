use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

use super::ImageBlob;

/// Where validated uploads go, if anywhere.
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Persist the blob. Returns the location it was written to, if any.
    async fn persist(&self, blob: &ImageBlob) -> Result<Option<PathBuf>>;
}

/// Keeps nothing. The default.
pub struct NoopStore;

#[async_trait]
impl UploadStore for NoopStore {
    async fn persist(&self, _blob: &ImageBlob) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Writes each upload to `<dir>/<sha256>.<ext>`. Identical uploads
/// land on the same file.
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl UploadStore for DiskStore {
    async fn persist(&self, blob: &ImageBlob) -> Result<Option<PathBuf>> {
        if !self.dir.exists() {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .with_context(|| format!("failed to create {}", self.dir.display()))?;
        }
        let path = self
            .dir
            .join(format!("{}.{}", blob.digest(), blob.mime().extension()));
        tokio::fs::write(&path, blob.bytes())
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ImageIngestor;

    fn blob() -> ImageBlob {
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
        bytes.extend_from_slice(b"not really a jpeg body");
        ImageIngestor::default().ingest(bytes, "image/jpeg").unwrap()
    }

    #[tokio::test]
    async fn noop_store_writes_nothing() {
        assert!(NoopStore.persist(&blob()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disk_store_writes_by_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path().join("uploads"));
        let blob = blob();

        let path = store.persist(&blob).await.unwrap().unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            format!("{}.jpg", blob.digest())
        );
        assert_eq!(std::fs::read(&path).unwrap(), blob.bytes());
    }
}
