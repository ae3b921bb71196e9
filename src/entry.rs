//! 条目模型 - 本地文件系统与远程存储共用的元数据表示

use serde::{Deserialize, Serialize};

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    ExecutableFile,
}

impl EntryKind {
    pub fn is_dir(self) -> bool {
        self == EntryKind::Directory
    }

    pub fn is_file(self) -> bool {
        !self.is_dir()
    }
}

/// 单个文件或目录的只读快照
///
/// `name` 是相对存储根的规范化路径：统一使用 `/`，不带首尾斜杠。
/// 目录通过 `kind` 区分，而不是保留末尾斜杠。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub size: u64,
    pub kind: EntryKind,
    /// 远程文件的摘要，空值表示无法比较
    pub digest: Option<String>,
}

impl Entry {
    pub fn file(name: &str, size: u64, digest: Option<String>) -> Self {
        Self {
            name: normalize_path(name),
            size,
            kind: EntryKind::File,
            digest: digest.filter(|d| !d.is_empty()),
        }
    }

    pub fn directory(name: &str) -> Self {
        Self {
            name: normalize_path(name),
            size: 0,
            kind: EntryKind::Directory,
            digest: None,
        }
    }

    /// 从原始列表名构造条目，末尾带分隔符的名称视为目录
    pub fn from_listing(raw_name: &str, size: u64, digest: Option<String>) -> Option<Self> {
        let is_dir = raw_name.ends_with('/') || raw_name.ends_with('\\');
        let entry = if is_dir {
            Self::directory(raw_name)
        } else {
            Self::file(raw_name, size, digest)
        };

        if entry.name.is_empty() || !is_contained(&entry.name) {
            return None;
        }
        Some(entry)
    }

    pub fn with_kind(mut self, kind: EntryKind) -> Self {
        self.kind = kind;
        if kind.is_dir() {
            self.size = 0;
            self.digest = None;
        }
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// 最后一级名称
    pub fn leaf_name(&self) -> &str {
        leaf_name(&self.name)
    }

    /// 所在目录的规范化路径（根目录为空串）
    pub fn parent(&self) -> &str {
        parent_path(&self.name)
    }

    /// 作为远程路径使用时的形式，目录带末尾斜杠
    pub fn remote_path(&self) -> String {
        if self.is_dir() {
            format!("{}/", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// 规范化路径：统一分隔符，去掉首尾斜杠、空段和 `.`
pub fn normalize_path(raw: &str) -> String {
    raw.replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// 路径是否不含 `..` 段（不会越出所在的根目录）
pub fn is_contained(path: &str) -> bool {
    path.replace('\\', "/").split('/').all(|s| s != "..")
}

/// 拼接目录前缀与子路径
pub fn join_path(prefix: &str, name: &str) -> String {
    let prefix = normalize_path(prefix);
    let name = normalize_path(name);
    match (prefix.is_empty(), name.is_empty()) {
        (true, _) => name,
        (_, true) => prefix,
        _ => format!("{}/{}", prefix, name),
    }
}

/// 作为目录列表前缀使用的形式（根目录为空串）
pub fn dir_prefix(path: &str) -> String {
    let path = normalize_path(path);
    if path.is_empty() {
        path
    } else {
        format!("{}/", path)
    }
}

pub fn leaf_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn parent_path(path: &str) -> &str {
    path.rfind('/').map_or("", |i| &path[..i])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a/b/"), "a/b");
        assert_eq!(normalize_path("a\\b\\c.txt"), "a/b/c.txt");
        assert_eq!(normalize_path("//a//./b"), "a/b");
        assert_eq!(normalize_path("/"), "");
        assert_eq!(normalize_path("Mixed/Case"), "Mixed/Case");
    }

    #[test]
    fn test_parent_segments_are_not_contained() {
        assert!(is_contained("a/b.txt"));
        assert!(is_contained("a/..b/c"));
        assert!(!is_contained("../escaped.txt"));
        assert!(!is_contained("a/../../b"));
        assert!(!is_contained("a\\..\\b"));
        assert!(Entry::from_listing("../x", 1, None).is_none());
        assert!(Entry::from_listing("a/../", 0, None).is_none());
    }

    #[test]
    fn test_from_listing_detects_folders() {
        let dir = Entry::from_listing("photos/2024/", 0, None).unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir.name, "photos/2024");
        assert_eq!(dir.remote_path(), "photos/2024/");

        let file = Entry::from_listing("/photos/a.jpg", 12, Some("abc".into())).unwrap();
        assert!(file.is_file());
        assert_eq!(file.name, "photos/a.jpg");
        assert_eq!(file.leaf_name(), "a.jpg");
        assert_eq!(file.parent(), "photos");

        assert!(Entry::from_listing("/", 0, None).is_none());
    }

    #[test]
    fn test_empty_digest_is_absent() {
        let file = Entry::file("a", 1, Some(String::new()));
        assert_eq!(file.digest, None);
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "a.txt"), "a.txt");
        assert_eq!(join_path("dir/", "/a.txt"), "dir/a.txt");
        assert_eq!(join_path("dir", ""), "dir");
        assert_eq!(dir_prefix("a/b"), "a/b/");
        assert_eq!(dir_prefix("/"), "");
    }
}
