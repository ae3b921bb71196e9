use crate::entry::{is_contained, leaf_name, normalize_path, Entry};
use crate::error::Result;
use crate::storage::local::list_local_dir;
use crate::storage::StorageBackend;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 单个名称的比较结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// 两边都是目录，需要递归
    Recurse,
    /// 一边是文件一边是目录
    TypeConflict,
    /// 两边都是大小相同的文件，需要校验摘要
    FileMatch,
    /// 两边都是文件但大小不同
    Differ,
    /// 只有本地有
    LocalOnly,
    /// 只有远程有
    RemoteOnly,
}

/// 本地条目及其完整路径
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub entry: Entry,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DiffItem {
    /// 当前目录下的名称（最后一级）
    pub name: String,
    pub local: Option<LocalEntry>,
    pub remote: Option<Entry>,
    pub class: Classification,
}

/// 一层目录的比较结果
#[derive(Debug, Clone)]
pub struct LevelDiff {
    pub remote_prefix: String,
    pub local_dir: PathBuf,
    /// 远程目录不存在时按空列表处理
    pub remote_exists: bool,
    pub local_exists: bool,
    pub items: Vec<DiffItem>,
}

/// 比较统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub recurse: usize,
    pub type_conflict: usize,
    pub file_match: usize,
    pub differ: usize,
    pub local_only: usize,
    pub remote_only: usize,
}

impl LevelDiff {
    pub fn summary(&self) -> DiffSummary {
        let mut summary = DiffSummary::default();
        for item in &self.items {
            match item.class {
                Classification::Recurse => summary.recurse += 1,
                Classification::TypeConflict => summary.type_conflict += 1,
                Classification::FileMatch => summary.file_match += 1,
                Classification::Differ => summary.differ += 1,
                Classification::LocalOnly => summary.local_only += 1,
                Classification::RemoteOnly => summary.remote_only += 1,
            }
        }
        summary
    }

    pub fn get(&self, name: &str) -> Option<&DiffItem> {
        self.items.iter().find(|i| i.name == name)
    }
}

/// 比较两个已匹配的条目
pub fn classify(local: &Entry, remote: &Entry) -> Classification {
    match (local.is_dir(), remote.is_dir()) {
        (true, true) => Classification::Recurse,
        (false, false) if local.size != remote.size => Classification::Differ,
        (false, false) => Classification::FileMatch,
        _ => Classification::TypeConflict,
    }
}

/// 单层目录比较器
pub struct TreeDiffer<'a> {
    storage: &'a dyn StorageBackend,
}

impl<'a> TreeDiffer<'a> {
    pub fn new(storage: &'a dyn StorageBackend) -> Self {
        Self { storage }
    }

    /// 比较远程目录与本地目录的一层条目
    ///
    /// 名称按规范化后的相对路径精确匹配，大小写语义跟随远程存储，不做转换。
    pub async fn diff(&self, remote_folder: &str, local_folder: &Path) -> Result<LevelDiff> {
        let prefix = normalize_path(remote_folder);

        let (remote_entries, remote_exists) = match self.storage.list_entries(&prefix).await {
            Ok(entries) => (entries, true),
            Err(e) if e.is_not_found() => {
                debug!("远程目录不存在，按空目录处理: {:?}", prefix);
                (Vec::new(), false)
            }
            Err(e) => return Err(e),
        };

        let (local_entries, local_exists) = match list_local_dir(local_folder, &prefix).await {
            Ok(entries) => (entries, true),
            Err(e) if e.is_not_found() => (Vec::new(), false),
            Err(e) => return Err(e),
        };

        // 只保留直接位于该目录下的远程条目
        let mut remote_by_name: HashMap<String, Entry> = HashMap::new();
        let mut remote_order: Vec<String> = Vec::new();
        for entry in remote_entries {
            if !is_contained(&entry.name) {
                warn!("跳过越出同步根目录的远程条目: {}", entry.name);
                continue;
            }
            if entry.parent() != prefix {
                continue;
            }
            let name = entry.leaf_name().to_string();
            if remote_by_name.contains_key(&name) {
                debug!("远程列表中重复的名称: {}", entry.name);
                continue;
            }
            remote_order.push(name.clone());
            remote_by_name.insert(name, entry);
        }

        let mut items = Vec::with_capacity(local_entries.len() + remote_by_name.len());
        for (entry, path) in local_entries {
            let name = leaf_name(&entry.name).to_string();
            let local = LocalEntry { entry, path };
            let item = match remote_by_name.remove(&name) {
                Some(remote) => DiffItem {
                    class: classify(&local.entry, &remote),
                    name,
                    local: Some(local),
                    remote: Some(remote),
                },
                None => DiffItem {
                    name,
                    local: Some(local),
                    remote: None,
                    class: Classification::LocalOnly,
                },
            };
            items.push(item);
        }

        for name in remote_order {
            if let Some(remote) = remote_by_name.remove(&name) {
                items.push(DiffItem {
                    name,
                    local: None,
                    remote: Some(remote),
                    class: Classification::RemoteOnly,
                });
            }
        }

        let diff = LevelDiff {
            remote_prefix: prefix,
            local_dir: local_folder.to_path_buf(),
            remote_exists,
            local_exists,
            items,
        };
        debug!("目录比较 {:?}: {:?}", diff.remote_prefix, diff.summary());
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_classify() {
        let dir = Entry::directory("a");
        let small = Entry::file("a", 1, None);
        let big = Entry::file("a", 2, None);
        assert_eq!(classify(&dir, &dir), Classification::Recurse);
        assert_eq!(classify(&dir, &small), Classification::TypeConflict);
        assert_eq!(classify(&small, &dir), Classification::TypeConflict);
        assert_eq!(classify(&small, &big), Classification::Differ);
        assert_eq!(classify(&small, &small), Classification::FileMatch);
    }

    #[tokio::test]
    async fn test_diff_one_level() {
        let local = tempfile::tempdir().unwrap();
        let root = local.path();
        std::fs::create_dir_all(root.join("both_dir")).unwrap();
        std::fs::create_dir_all(root.join("conflict")).unwrap();
        std::fs::write(root.join("same.txt"), b"hello").unwrap();
        std::fs::write(root.join("size.txt"), b"hello").unwrap();
        std::fs::write(root.join("local.txt"), b"x").unwrap();

        let remote = MemoryStorage::new();
        remote.put("base/both_dir/inner.txt", "i");
        remote.put("base/conflict", "file");
        remote.put("base/same.txt", "hello");
        remote.put("base/size.txt", "hello world");
        remote.put("base/remote.txt", "r");
        remote.put("base/remote_dir/deep/file", "d");

        let diff = TreeDiffer::new(&remote).diff("/base/", root).await.unwrap();
        assert!(diff.remote_exists);
        assert_eq!(diff.remote_prefix, "base");

        let class = |name: &str| diff.get(name).unwrap().class;
        assert_eq!(class("both_dir"), Classification::Recurse);
        assert_eq!(class("conflict"), Classification::TypeConflict);
        assert_eq!(class("same.txt"), Classification::FileMatch);
        assert_eq!(class("size.txt"), Classification::Differ);
        assert_eq!(class("local.txt"), Classification::LocalOnly);
        assert_eq!(class("remote.txt"), Classification::RemoteOnly);
        assert_eq!(class("remote_dir"), Classification::RemoteOnly);

        let same = diff.get("same.txt").unwrap();
        assert_eq!(same.local.as_ref().unwrap().entry.name, "base/same.txt");
        assert_eq!(same.remote.as_ref().unwrap().name, "base/same.txt");

        let summary = diff.summary();
        assert_eq!(summary.remote_only, 2);
        assert_eq!(summary.local_only, 1);
    }

    #[tokio::test]
    async fn test_missing_remote_is_empty() {
        let local = tempfile::tempdir().unwrap();
        std::fs::write(local.path().join("a.txt"), b"a").unwrap();
        let remote = MemoryStorage::new();

        let diff = TreeDiffer::new(&remote).diff("nothing", local.path()).await.unwrap();
        assert!(!diff.remote_exists);
        assert_eq!(diff.items.len(), 1);
        assert_eq!(diff.items[0].class, Classification::LocalOnly);
    }

    #[tokio::test]
    async fn test_parent_segments_are_skipped() {
        let local = tempfile::tempdir().unwrap();
        let remote = MemoryStorage::new();
        remote.put("../escaped.txt", "x");
        remote.put("ok.txt", "y");

        let diff = TreeDiffer::new(&remote).diff("", local.path()).await.unwrap();
        assert_eq!(diff.items.len(), 1);
        assert_eq!(diff.items[0].name, "ok.txt");
        assert!(diff.get("..").is_none());
    }

    #[tokio::test]
    async fn test_names_are_case_sensitive() {
        let local = tempfile::tempdir().unwrap();
        std::fs::write(local.path().join("Readme.md"), b"a").unwrap();
        let remote = MemoryStorage::new();
        remote.put("README.md", "a");

        let diff = TreeDiffer::new(&remote).diff("", local.path()).await.unwrap();
        assert_eq!(diff.get("Readme.md").unwrap().class, Classification::LocalOnly);
        assert_eq!(diff.get("README.md").unwrap().class, Classification::RemoteOnly);
    }
}
