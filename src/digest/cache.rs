//! 已发现段大小的缓存
//!
//! 以 (远程路径, 摘要) 为键。仅作为提示使用，缺失时校验结果不变，只是更慢。

use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct PartSizeCache {
    inner: RwLock<HashMap<(String, String), u64>>,
}

impl PartSizeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, remote_path: &str, digest: &str) -> Option<u64> {
        let cache = self.inner.read().await;
        cache
            .get(&(remote_path.to_string(), digest.to_string()))
            .copied()
    }

    pub async fn record(&self, remote_path: &str, digest: &str, part_size: u64) {
        let mut cache = self.inner.write().await;
        cache.insert((remote_path.to_string(), digest.to_string()), part_size);
    }

    pub async fn forget(&self, remote_path: &str, digest: &str) {
        let mut cache = self.inner.write().await;
        cache.remove(&(remote_path.to_string(), digest.to_string()));
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_forget() {
        let cache = PartSizeCache::new();
        assert_eq!(cache.get("a/b.bin", "x-2").await, None);

        cache.record("a/b.bin", "x-2", 5).await;
        assert_eq!(cache.get("a/b.bin", "x-2").await, Some(5));
        // 摘要变化即为不同条目
        assert_eq!(cache.get("a/b.bin", "y-2").await, None);

        cache.forget("a/b.bin", "x-2").await;
        assert!(cache.is_empty().await);
    }
}
