pub mod local;
pub mod memory;
pub mod object;
pub mod read_only;

use crate::entry::Entry;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use object::ObjectStorage;
pub use read_only::ReadOnlyStorage;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete, list 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;
/// 流式下载时每次读取的块大小
pub const DOWNLOAD_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// 字节流
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// 存储抽象接口
///
/// 路径均为相对存储根的规范化路径；以 `/` 结尾的路径表示目录。
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// 列出目录下一级条目（不递归）
    ///
    /// 目录不存在时返回 `SyncError::NotFound`。
    async fn list_entries(&self, prefix: &str) -> Result<Vec<Entry>>;

    /// 流式上传，`size_hint` 为预期总字节数
    async fn upload_stream(&self, path: &str, stream: ByteStream, size_hint: Option<u64>)
        -> Result<()>;

    /// 流式下载
    async fn download_stream(&self, path: &str) -> Result<ByteStream>;

    /// 删除文件；目录路径删除整个子树
    async fn delete_entry(&self, path: &str) -> Result<()>;

    /// 是否只读
    fn is_read_only(&self) -> bool {
        false
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 存储类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    S3,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub typ: StorageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// 只读模式：拒绝上传和删除
    #[serde(default)]
    pub read_only: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            typ: StorageType::Local,
            path: None,
            bucket: None,
            region: None,
            access_key: None,
            secret_key: None,
            endpoint: None,
            prefix: None,
            read_only: false,
        }
    }
}

/// 根据配置创建存储实例
///
/// `upload_part_size` 为分段上传的段大小（<= 0 表示不指定）。
pub fn create_storage(
    config: &StorageConfig,
    upload_part_size: i64,
) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let storage: Arc<dyn StorageBackend> = match config.typ {
        StorageType::Local => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Local storage requires path"))?;
            tracing::info!("初始化本地存储: {}", path);
            Arc::new(LocalStorage::new(path)?)
        }
        StorageType::S3 => {
            let bucket = config
                .bucket
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires bucket"))?;
            let region = config
                .region
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires region"))?;
            let access_key = config
                .access_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires accessKey"))?;
            let secret_key = config
                .secret_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires secretKey"))?;
            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            Arc::new(
                ObjectStorage::s3(
                    bucket,
                    region,
                    access_key,
                    secret_key,
                    config.endpoint.clone(),
                    config.prefix.clone(),
                )?
                .with_upload_part_size(upload_part_size),
            )
        }
    };

    if config.read_only {
        tracing::info!("存储以只读模式打开: {}", storage.name());
        return Ok(Arc::new(ReadOnlyStorage::new(storage)));
    }
    Ok(storage)
}
