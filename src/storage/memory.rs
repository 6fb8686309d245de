use crate::storage::{validate_key, BlobStore, StorageResult, TransferProgress};
use crate::uploader::{SourceContent, SourceFile};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// 进程内对象存储
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<DashMap<String, Bytes>>,
    transfers: Arc<AtomicUsize>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// `transfer` 被调用的总次数（含重复写入同一键）
    pub fn transfer_count(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn transfer(
        &self,
        source: &SourceFile,
        destination_key: &str,
        progress: &TransferProgress,
    ) -> StorageResult<String> {
        validate_key(destination_key)?;
        self.transfers.fetch_add(1, Ordering::SeqCst);

        let data = match &source.content {
            SourceContent::Bytes(data) => data.clone(),
            SourceContent::File(path) => Bytes::from(tokio::fs::read(path).await?),
        };

        progress.report_bytes(data.len() as u64, source.size.max(data.len() as u64));
        self.objects.insert(destination_key.to_string(), data);

        Ok(format!("memory://{}", destination_key))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transfer() {
        let store = MemoryBlobStore::new();
        let source = SourceFile::from_bytes("a.png", "image/png", vec![1u8, 2, 3]);

        let url = store
            .transfer(&source, "p1/a.png", &TransferProgress::noop())
            .await
            .unwrap();

        assert_eq!(url, "memory://p1/a.png");
        assert_eq!(store.get("p1/a.png").unwrap().as_ref(), &[1u8, 2, 3]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.transfer_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_rejects_bad_key() {
        let store = MemoryBlobStore::new();
        let source = SourceFile::from_bytes("a.png", "image/png", vec![1u8]);
        assert!(store
            .transfer(&source, "/abs", &TransferProgress::noop())
            .await
            .is_err());
        assert!(store.is_empty());
    }
}
