use super::{ByteStream, StorageBackend};
use crate::entry::Entry;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::sync::Arc;

/// 只读包装：上传和删除在转发前直接拒绝
pub struct ReadOnlyStorage {
    inner: Arc<dyn StorageBackend>,
    name: String,
}

impl ReadOnlyStorage {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        let name = format!("{} (只读)", inner.name());
        Self { inner, name }
    }
}

#[async_trait]
impl StorageBackend for ReadOnlyStorage {
    async fn list_entries(&self, prefix: &str) -> Result<Vec<Entry>> {
        self.inner.list_entries(prefix).await
    }

    async fn upload_stream(
        &self,
        path: &str,
        _stream: ByteStream,
        _size_hint: Option<u64>,
    ) -> Result<()> {
        Err(SyncError::ReadOnly(format!("上传 {}", path)))
    }

    async fn download_stream(&self, path: &str) -> Result<ByteStream> {
        self.inner.download_stream(path).await
    }

    async fn delete_entry(&self, path: &str) -> Result<()> {
        Err(SyncError::ReadOnly(format!("删除 {}", path)))
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}
