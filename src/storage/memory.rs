//! 内存存储 - 用于测试的对象存储替身
//!
//! 行为与对象存储一致：目录是隐式前缀，上传时按配置的段大小生成单段或分段摘要。

use super::{ByteStream, StorageBackend};
use crate::digest::{composite_digest, single_part_digest};
use crate::entry::{dir_prefix, normalize_path, Entry};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    digest: String,
}

/// 调用计数
#[derive(Debug, Default)]
pub struct CallCounters {
    pub lists: AtomicUsize,
    pub uploads: AtomicUsize,
    pub downloads: AtomicUsize,
    pub deletes: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallSnapshot {
    pub lists: usize,
    pub uploads: usize,
    pub downloads: usize,
    pub deletes: usize,
}

pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    /// 超过此大小的对象按分段上传处理，0 表示始终单段
    part_size: usize,
    counters: CallCounters,
    name: String,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            part_size: 0,
            counters: CallCounters::default(),
            name: "memory:".to_string(),
        }
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    /// 锁中毒时继续使用内部数据
    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn digest_for(&self, data: &[u8]) -> String {
        if self.part_size > 0 && data.len() > self.part_size {
            composite_digest(data, self.part_size)
        } else {
            single_part_digest(data)
        }
    }

    /// 直接写入对象（不计入调用次数）
    pub fn put(&self, path: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let digest = self.digest_for(&data);
        self.put_with_digest(path, data, &digest);
    }

    /// 以指定摘要写入对象，用于模拟其他客户端上传的分段对象
    pub fn put_with_digest(&self, path: &str, data: impl Into<Bytes>, digest: &str) {
        let mut objects = self.objects();
        objects.insert(
            normalize_path(path),
            StoredObject {
                data: data.into(),
                digest: digest.to_string(),
            },
        );
    }

    /// 写入目录占位对象
    pub fn put_folder(&self, path: &str) {
        let mut objects = self.objects();
        objects.insert(
            dir_prefix(path),
            StoredObject {
                data: Bytes::new(),
                digest: String::new(),
            },
        );
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        let objects = self.objects();
        objects.get(&normalize_path(path)).map(|o| o.data.clone())
    }

    pub fn digest(&self, path: &str) -> Option<String> {
        let objects = self.objects();
        objects.get(&normalize_path(path)).map(|o| o.digest.clone())
    }

    /// 所有文件对象的键（不含目录占位）
    pub fn keys(&self) -> Vec<String> {
        let objects = self.objects();
        objects
            .keys()
            .filter(|k| !k.ends_with('/'))
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> CallSnapshot {
        CallSnapshot {
            lists: self.counters.lists.load(Ordering::Relaxed),
            uploads: self.counters.uploads.load(Ordering::Relaxed),
            downloads: self.counters.downloads.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn list_entries(&self, prefix: &str) -> Result<Vec<Entry>> {
        self.counters.lists.fetch_add(1, Ordering::Relaxed);
        let dir = dir_prefix(prefix);
        let objects = self.objects();

        let mut entries: Vec<Entry> = Vec::new();
        let mut found = false;
        for (key, object) in objects.range(dir.clone()..) {
            let Some(rest) = key.strip_prefix(&dir) else {
                break;
            };
            found = true;
            if rest.is_empty() {
                continue;
            }

            // 与对象存储的分隔符列表一致：更深层的键折叠为一级目录
            let entry = match rest.find('/') {
                Some(i) => Entry::directory(&format!("{}{}", dir, &rest[..i])),
                None => Entry::file(key, object.data.len() as u64, Some(object.digest.clone())),
            };
            if entries.last().map(|e| e.name != entry.name).unwrap_or(true) {
                entries.push(entry);
            }
        }

        if !found && !dir.is_empty() {
            return Err(SyncError::NotFound(normalize_path(&dir)));
        }
        Ok(entries)
    }

    async fn upload_stream(
        &self,
        path: &str,
        mut stream: ByteStream,
        _size_hint: Option<u64>,
    ) -> Result<()> {
        self.counters.uploads.fetch_add(1, Ordering::Relaxed);
        let mut data = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }
        self.put(path, data.freeze());
        Ok(())
    }

    async fn download_stream(&self, path: &str) -> Result<ByteStream> {
        self.counters.downloads.fetch_add(1, Ordering::Relaxed);
        let data = self
            .get(path)
            .ok_or_else(|| SyncError::NotFound(normalize_path(path)))?;

        // 拆成小块，模拟分块下载
        let chunks: Vec<Result<Bytes>> = data
            .chunks(64 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn delete_entry(&self, path: &str) -> Result<()> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        let mut objects = self.objects();
        if path.ends_with('/') {
            let dir = dir_prefix(path);
            objects.retain(|key, _| !key.starts_with(&dir));
        } else {
            objects.remove(&normalize_path(path));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
