//! 目录同步：在本地目录树与远程对象存储之间按需上传/下载/删除，
//! 通过对象摘要（含分段上传摘要）判断内容是否一致。

pub mod config;
pub mod core;
pub mod digest;
pub mod entry;
pub mod error;
pub mod logging;
pub mod storage;

pub use crate::config::{AppConfig, TransferConfig};
pub use crate::core::{SyncConfig, SyncDirection, SyncEngine, SyncReport, SyncRequest};
pub use crate::digest::{DigestVerifier, PartSizeCache, PartSizePolicy, Verdict};
pub use crate::entry::{Entry, EntryKind};
pub use crate::error::{Result, SyncError};
pub use crate::storage::{create_storage, StorageBackend, StorageConfig, StorageType};

/// 平台相关的默认目录
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
