//! 同步错误类型

use thiserror::Error;

/// 同步过程中的错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 远程路径或本地目录不存在
    #[error("路径不存在: {0}")]
    NotFound(String),

    /// 对只读存储执行写入或删除
    #[error("存储为只读模式，拒绝操作: {0}")]
    ReadOnly(String),

    /// 读取本地文件时在 EOF 之前读到 0 字节（文件可能被并发截断）
    #[error("读取中断: {path} 在偏移 {offset} 处提前结束 (预期 {expected} 字节)")]
    TruncatedRead {
        path: String,
        offset: u64,
        expected: u64,
    },

    #[error("操作已取消")]
    Cancelled,

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("存储错误: {0}")]
    Storage(#[from] opendal::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// 是否为"不存在"类错误（列表时视为空目录）
    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::NotFound(_) => true,
            SyncError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            SyncError::Storage(e) => e.kind() == opendal::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// 是否必须立即终止整个同步调用
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Cancelled | SyncError::ReadOnly(_))
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
