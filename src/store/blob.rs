use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob not found: {0}/{1}")]
    NotFound(String, String),
}

/// MIME blob storage, keyed by `list_id/urlencoded(msg_id)` (SPEC_FULL.md §3,
/// §6.4). One abstract trait per collaborator, per §9's "explicit trait
/// types" instruction.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, list_id: &str, msg_id: &str, bytes: &[u8]) -> Result<(), BlobError>;
    async fn get(&self, list_id: &str, msg_id: &str) -> Result<Vec<u8>, BlobError>;
    async fn stat(&self, list_id: &str, msg_id: &str) -> Result<u64, BlobError>;
    async fn del(&self, list_id: &str, msg_id: &str) -> Result<(), BlobError>;
}

/// Local-filesystem implementation suitable for a single-binary deployment
/// of this crate.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    base_dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, list_id: &str, msg_id: &str) -> PathBuf {
        let key: String = url::form_urlencoded::byte_serialize(msg_id.as_bytes()).collect();
        self.base_dir.join(list_id).join(key)
    }
}

#[async_trait]
impl ObjectStore for LocalBlobStore {
    async fn put(&self, list_id: &str, msg_id: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let path = self.path_for(list_id, msg_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(bytes).await?;
        Ok(())
    }

    async fn get(&self, list_id: &str, msg_id: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(list_id, msg_id);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| BlobError::NotFound(list_id.to_owned(), msg_id.to_owned()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn stat(&self, list_id: &str, msg_id: &str) -> Result<u64, BlobError> {
        let path = self.path_for(list_id, msg_id);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| BlobError::NotFound(list_id.to_owned(), msg_id.to_owned()))?;
        Ok(meta.len())
    }

    async fn del(&self, list_id: &str, msg_id: &str) -> Result<(), BlobError> {
        let path = self.path_for(list_id, msg_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Removes every blob for `list_id` in one pass, used by cascade cleanup.
pub async fn delete_list_dir(base_dir: &Path, list_id: &str) -> Result<(), BlobError> {
    match tokio::fs::remove_dir_all(base_dir.join(list_id)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn roundtrip() {
        let dir = tempdir();
        let store = LocalBlobStore::new(dir.clone());

        store.put("u.chatter", "<m1@example.org>", b"hello").await.unwrap();
        let bytes = store.get("u.chatter", "<m1@example.org>").await.unwrap();
        assert_eq!(bytes, b"hello");

        store.del("u.chatter", "<m1@example.org>").await.unwrap();
        assert!(store.get("u.chatter", "<m1@example.org>").await.is_err());

        std::fs::remove_dir_all(dir).ok();
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("threadmail-test-{}", rand::random::<u64>()));
        dir
    }
}
