use super::{ByteStream, StorageBackend, DOWNLOAD_CHUNK_SIZE, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use crate::entry::{dir_prefix, normalize_path, Entry};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use opendal::{layers::TimeoutLayer, Metakey, Operator};
use std::time::Duration;
use tracing::debug;

/// 基于 OpenDAL 的对象存储
///
/// 目录是隐式的：以 `/` 结尾的键前缀。对象摘要取自 ETag。
pub struct ObjectStorage {
    operator: Operator,
    name: String,
    /// 分段上传的段大小，<= 0 时由 OpenDAL 自行决定
    upload_part_size: i64,
}

impl ObjectStorage {
    pub fn s3(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
        prefix: Option<String>,
    ) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if let Some(ref p) = prefix {
            builder = builder.root(p);
        }

        let operator = Operator::new(builder)?.finish();

        let name = format!(
            "s3://{}{}",
            bucket,
            prefix
                .as_deref()
                .map(|p| format!("/{}", p.trim_matches('/')))
                .unwrap_or_default()
        );

        Ok(Self::from_operator(operator, name))
    }

    /// 包装任意 OpenDAL 服务，统一加超时层
    pub fn from_operator(operator: Operator, name: impl Into<String>) -> Self {
        let operator = operator.layer(
            TimeoutLayer::default()
                .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
        );

        Self {
            operator,
            name: name.into(),
            upload_part_size: 0,
        }
    }

    pub fn with_upload_part_size(mut self, size: i64) -> Self {
        self.upload_part_size = size;
        self
    }
}

#[async_trait]
impl StorageBackend for ObjectStorage {
    async fn list_entries(&self, prefix: &str) -> Result<Vec<Entry>> {
        let dir = dir_prefix(prefix);
        let list_path = if dir.is_empty() { "/" } else { dir.as_str() };
        let own_name = normalize_path(&dir);

        let mut lister = self
            .operator
            .lister_with(list_path)
            .metakey(Metakey::ContentLength | Metakey::Mode | Metakey::Etag)
            .await?;

        let mut entries = Vec::new();
        let mut seen_marker = false;

        while let Some(item) = lister.try_next().await? {
            let path = item.path();

            // 目录自身的占位对象
            if normalize_path(path) == own_name {
                seen_marker = true;
                continue;
            }

            let meta = item.metadata();
            let raw = if meta.is_dir() && !path.ends_with('/') {
                format!("{}/", path)
            } else {
                path.to_string()
            };

            if let Some(entry) = Entry::from_listing(
                &raw,
                meta.content_length(),
                meta.etag().map(|s| s.trim_matches('"').to_string()),
            ) {
                entries.push(entry);
            }
        }

        // 对象存储里不存在的"目录"列出为空
        if entries.is_empty() && !seen_marker && !own_name.is_empty() {
            return Err(SyncError::NotFound(own_name));
        }

        Ok(entries)
    }

    async fn upload_stream(
        &self,
        path: &str,
        mut stream: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<()> {
        let path = normalize_path(path);
        debug!("上传对象: {} ({:?} 字节)", path, size_hint);

        let mut future = self.operator.writer_with(&path);
        if self.upload_part_size > 0 {
            future = future.chunk(self.upload_part_size as usize);
        }
        let mut writer = future.await?;

        while let Some(chunk) = stream.next().await {
            let written = match chunk {
                Ok(bytes) => writer.write(bytes).await.map_err(SyncError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                let _ = writer.abort().await;
                return Err(e);
            }
        }

        writer.close().await?;
        Ok(())
    }

    async fn download_stream(&self, path: &str) -> Result<ByteStream> {
        let path = normalize_path(path);
        let size = self.operator.stat(&path).await?.content_length();
        let operator = self.operator.clone();

        // 按块读取范围，避免整个对象驻留内存
        let stream = futures::stream::try_unfold(0u64, move |offset| {
            let operator = operator.clone();
            let path = path.clone();
            async move {
                if offset >= size {
                    return Ok::<_, SyncError>(None);
                }
                let end = (offset + DOWNLOAD_CHUNK_SIZE).min(size);
                let data = operator.read_with(&path).range(offset..end).await?;
                Ok(Some((data.to_bytes(), end)))
            }
        });

        Ok(stream.boxed())
    }

    async fn delete_entry(&self, path: &str) -> Result<()> {
        if path.ends_with('/') {
            let dir = dir_prefix(path);
            debug!("删除对象前缀: {}", dir);
            self.operator.remove_all(&dir).await?;
        } else {
            // S3 删除不存在的对象不会报错
            self.operator.delete(&normalize_path(path)).await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn memory_storage() -> ObjectStorage {
        let operator = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        ObjectStorage::from_operator(operator, "memory")
    }

    async fn read_all(mut stream: ByteStream) -> Vec<u8> {
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk.unwrap());
        }
        data
    }

    #[tokio::test]
    async fn test_upload_list_download_delete() {
        let storage = memory_storage();
        let chunks = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let stream: ByteStream = futures::stream::iter(chunks).boxed();
        storage.upload_stream("docs/a.txt", stream, Some(11)).await.unwrap();

        let root = storage.list_entries("").await.unwrap();
        assert_eq!(root.len(), 1);
        assert!(root[0].is_dir());
        assert_eq!(root[0].name, "docs");

        let docs = storage.list_entries("docs").await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].name, "docs/a.txt");
        assert_eq!(docs[0].size, 11);

        let data = read_all(storage.download_stream("docs/a.txt").await.unwrap()).await;
        assert_eq!(data, b"hello world");

        storage.delete_entry("docs/").await.unwrap();
        assert!(storage.list_entries("docs").await.unwrap_err().is_not_found());
    }
}
