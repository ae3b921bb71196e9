use crate::core::differ::{Classification, DiffItem, LocalEntry, TreeDiffer};
use crate::digest::{DigestVerifier, PartSizeCache, PartSizePolicy};
use crate::entry::{join_path, normalize_path, Entry, EntryKind};
use crate::error::{Result, SyncError};
use crate::storage::StorageBackend;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 上传时读取本地文件的块大小
const UPLOAD_READ_CAPACITY: usize = 1024 * 1024;

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 分段大小策略（用于分段摘要校验）
    pub part_sizes: PartSizePolicy,
    /// 摘要校验时的读取缓冲区大小
    pub read_buffer_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            part_sizes: PartSizePolicy::default(),
            read_buffer_size: crate::digest::verifier::DEFAULT_READ_BUFFER,
        }
    }
}

/// 同步方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    RemoteToLocal,
    LocalToRemote,
}

/// 单次同步请求
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub local_root: PathBuf,
    /// 为 true 时不删除任何内容（默认）
    pub dont_delete: bool,
    /// 只同步远程的某个子路径
    pub sub_path: Option<String>,
}

impl SyncRequest {
    pub fn new(local_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            dont_delete: true,
            sub_path: None,
        }
    }

    /// 允许删除目标端多余或类型冲突的条目
    pub fn allow_delete(mut self) -> Self {
        self.dont_delete = false;
        self
    }

    pub fn with_sub_path(mut self, sub_path: impl Into<String>) -> Self {
        self.sub_path = Some(sub_path.into());
        self
    }

    fn remote_prefix(&self) -> String {
        normalize_path(self.sub_path.as_deref().unwrap_or(""))
    }

    fn local_dir(&self) -> PathBuf {
        let prefix = self.remote_prefix();
        if prefix.is_empty() {
            self.local_root.clone()
        } else {
            self.local_root.join(prefix)
        }
    }
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub direction: SyncDirection,
    pub storage: String,
    pub sub_path: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub files_uploaded: u32,
    pub files_downloaded: u32,
    pub files_deleted: u32,
    pub dirs_deleted: u32,
    pub files_unchanged: u32,
    pub conflicts_skipped: u32,
    pub bytes_transferred: u64,
    pub errors: Vec<String>,
}

impl SyncReport {
    fn new(direction: SyncDirection, storage: &str, sub_path: Option<String>) -> Self {
        Self {
            direction,
            storage: storage.to_string(),
            sub_path,
            start_time: chrono::Utc::now().timestamp(),
            end_time: 0,
            files_uploaded: 0,
            files_downloaded: 0,
            files_deleted: 0,
            dirs_deleted: 0,
            files_unchanged: 0,
            conflicts_skipped: 0,
            bytes_transferred: 0,
            errors: Vec::new(),
        }
    }

    /// 是否没有任何条目失败
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// 传输和删除操作的总数
    pub fn changes(&self) -> u32 {
        self.files_uploaded + self.files_downloaded + self.files_deleted + self.dirs_deleted
    }

    fn record_failure(&mut self, path: &str, error: &SyncError) {
        warn!("同步条目失败: {} - {}", path, error);
        self.errors.push(format!("{}: {}", path, error));
    }
}

/// 同步引擎
///
/// 每一层目录：列出两边条目并分类，大小相同的文件用摘要校验，
/// 再按方向上传/下载/删除，最后逐个递归子目录（深度优先、顺序执行）。
pub struct SyncEngine {
    storage: Arc<dyn StorageBackend>,
    verifier: DigestVerifier,
}

impl SyncEngine {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self::with_config(storage, SyncConfig::default())
    }

    pub fn with_config(storage: Arc<dyn StorageBackend>, config: SyncConfig) -> Self {
        let verifier =
            DigestVerifier::new(config.part_sizes).with_read_buffer(config.read_buffer_size);
        Self { storage, verifier }
    }

    /// 与其它引擎共享段大小缓存
    pub fn with_cache(mut self, cache: Arc<PartSizeCache>) -> Self {
        self.verifier = self.verifier.with_cache(cache);
        self
    }

    pub fn verifier(&self) -> &DigestVerifier {
        &self.verifier
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// 远程 -> 本地
    pub async fn sync_remote_to_local(
        &self,
        request: &SyncRequest,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::new(
            SyncDirection::RemoteToLocal,
            self.storage.name(),
            request.sub_path.clone(),
        );
        info!(
            "开始下载同步: {} -> {:?} (子路径: {:?}, 禁止删除: {})",
            self.storage.name(),
            request.local_root,
            request.sub_path,
            request.dont_delete
        );

        self.pull_level(
            request.remote_prefix(),
            request.local_dir(),
            request.dont_delete,
            &mut report,
            cancel,
        )
        .await?;

        Ok(self.finish(report))
    }

    /// 本地 -> 远程
    pub async fn sync_local_to_remote(
        &self,
        request: &SyncRequest,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        if self.storage.is_read_only() {
            return Err(SyncError::ReadOnly(format!(
                "无法上传到 {}",
                self.storage.name()
            )));
        }

        let local_dir = request.local_dir();
        if !fs::metadata(&local_dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(SyncError::NotFound(local_dir.display().to_string()));
        }

        let mut report = SyncReport::new(
            SyncDirection::LocalToRemote,
            self.storage.name(),
            request.sub_path.clone(),
        );
        info!(
            "开始上传同步: {:?} -> {} (子路径: {:?}, 禁止删除: {})",
            request.local_root,
            self.storage.name(),
            request.sub_path,
            request.dont_delete
        );

        self.push_level(
            request.remote_prefix(),
            local_dir,
            request.dont_delete,
            &mut report,
            cancel,
        )
        .await?;

        Ok(self.finish(report))
    }

    fn finish(&self, mut report: SyncReport) -> SyncReport {
        report.end_time = chrono::Utc::now().timestamp();
        info!(
            "同步完成: 上传 {}, 下载 {}, 删除 {} 文件/{} 目录, 未变化 {}, 冲突跳过 {}, 失败 {}",
            report.files_uploaded,
            report.files_downloaded,
            report.files_deleted,
            report.dirs_deleted,
            report.files_unchanged,
            report.conflicts_skipped,
            report.errors.len()
        );
        report
    }

    // ============ 远程 -> 本地 ============

    fn pull_level<'a>(
        &'a self,
        remote_dir: String,
        local_dir: PathBuf,
        dont_delete: bool,
        report: &'a mut SyncReport,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            fs::create_dir_all(&local_dir).await?;
            let diff = TreeDiffer::new(self.storage.as_ref())
                .diff(&remote_dir, &local_dir)
                .await?;

            let mut subdirs: Vec<(String, PathBuf)> = Vec::new();
            for item in diff.items {
                let path = join_path(&remote_dir, &item.name);
                match self
                    .pull_item(&item, &local_dir, dont_delete, report, cancel)
                    .await
                {
                    Ok(true) => subdirs.push((path, local_dir.join(&item.name))),
                    Ok(false) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => report.record_failure(&path, &e),
                }
            }

            for (remote_child, local_child) in subdirs {
                let label = remote_child.clone();
                match self
                    .pull_level(remote_child, local_child, dont_delete, report, cancel)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => report.record_failure(&label, &e),
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// 处理单个条目，返回是否需要递归进入远程子目录
    async fn pull_item(
        &self,
        item: &DiffItem,
        local_dir: &Path,
        dont_delete: bool,
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let target = local_dir.join(&item.name);

        match (item.class, item.local.as_ref(), item.remote.as_ref()) {
            (Classification::Recurse, _, _) => Ok(true),
            (Classification::LocalOnly, Some(local), _) => {
                if dont_delete {
                    debug!("保留本地多余条目: {:?}", local.path);
                } else {
                    self.delete_local(local, report).await?;
                }
                Ok(false)
            }
            (Classification::RemoteOnly, _, Some(remote)) => {
                if remote.is_dir() {
                    return Ok(true);
                }
                self.download(remote, &target, report, cancel).await?;
                Ok(false)
            }
            (Classification::TypeConflict, Some(local), Some(remote)) => {
                if dont_delete {
                    debug!("类型冲突，跳过: {}", remote.name);
                    report.conflicts_skipped += 1;
                    return Ok(false);
                }
                self.delete_local(local, report).await?;
                if remote.is_dir() {
                    return Ok(true);
                }
                self.download(remote, &target, report, cancel).await?;
                Ok(false)
            }
            (Classification::FileMatch, Some(local), Some(remote)) => {
                if self.is_identical(local, remote, cancel).await? {
                    debug!("文件未变化，跳过: {}", remote.name);
                    report.files_unchanged += 1;
                    return Ok(false);
                }
                self.replace_local(local, remote, &target, dont_delete, report, cancel)
                    .await?;
                Ok(false)
            }
            (Classification::Differ, Some(local), Some(remote)) => {
                self.replace_local(local, remote, &target, dont_delete, report, cancel)
                    .await?;
                Ok(false)
            }
            (class, _, _) => Err(SyncError::Other(anyhow::anyhow!(
                "比较结果不完整: {} ({:?})",
                item.name,
                class
            ))),
        }
    }

    /// 内容不一致时用远程文件替换本地文件
    async fn replace_local(
        &self,
        local: &LocalEntry,
        remote: &Entry,
        target: &Path,
        dont_delete: bool,
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !dont_delete {
            fs::remove_file(&local.path).await?;
        }
        // 禁止删除时直接覆盖：下载先写入临时文件，完成后才替换
        self.download(remote, target, report, cancel).await
    }

    async fn delete_local(&self, local: &LocalEntry, report: &mut SyncReport) -> Result<()> {
        if local.entry.is_dir() {
            debug!("删除本地目录: {:?}", local.path);
            fs::remove_dir_all(&local.path).await?;
            report.dirs_deleted += 1;
        } else {
            debug!("删除本地文件: {:?}", local.path);
            fs::remove_file(&local.path).await?;
            report.files_deleted += 1;
        }
        Ok(())
    }

    async fn download(
        &self,
        remote: &Entry,
        target: &Path,
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let bytes = download_file(self.storage.as_ref(), remote, target, cancel).await?;
        report.files_downloaded += 1;
        report.bytes_transferred += bytes;
        Ok(())
    }

    // ============ 本地 -> 远程 ============

    fn push_level<'a>(
        &'a self,
        remote_dir: String,
        local_dir: PathBuf,
        dont_delete: bool,
        report: &'a mut SyncReport,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let diff = TreeDiffer::new(self.storage.as_ref())
                .diff(&remote_dir, &local_dir)
                .await?;
            if !diff.local_exists {
                return Err(SyncError::NotFound(local_dir.display().to_string()));
            }

            let mut subdirs: Vec<(String, PathBuf)> = Vec::new();
            for item in diff.items {
                let path = join_path(&remote_dir, &item.name);
                match self.push_item(&item, &path, dont_delete, report, cancel).await {
                    Ok(true) => subdirs.push((path, local_dir.join(&item.name))),
                    Ok(false) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => report.record_failure(&path, &e),
                }
            }

            for (remote_child, local_child) in subdirs {
                let label = remote_child.clone();
                match self
                    .push_level(remote_child, local_child, dont_delete, report, cancel)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => report.record_failure(&label, &e),
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// 处理单个条目，返回是否需要递归进入本地子目录
    async fn push_item(
        &self,
        item: &DiffItem,
        remote_path: &str,
        dont_delete: bool,
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        match (item.class, item.local.as_ref(), item.remote.as_ref()) {
            (Classification::Recurse, _, _) => Ok(true),
            (Classification::LocalOnly, Some(local), _) => {
                if local.entry.is_dir() {
                    return Ok(true);
                }
                self.upload(local, remote_path, report, cancel).await?;
                Ok(false)
            }
            (Classification::RemoteOnly, _, Some(remote)) => {
                if dont_delete {
                    debug!("保留远程多余条目: {}", remote.name);
                } else {
                    self.delete_remote(remote, report).await?;
                }
                Ok(false)
            }
            (Classification::TypeConflict, Some(local), Some(remote)) => {
                if dont_delete {
                    debug!("类型冲突，跳过: {}", remote.name);
                    report.conflicts_skipped += 1;
                    return Ok(false);
                }
                self.delete_remote(remote, report).await?;
                if local.entry.is_dir() {
                    return Ok(true);
                }
                self.upload(local, remote_path, report, cancel).await?;
                Ok(false)
            }
            (Classification::FileMatch, Some(local), Some(remote)) => {
                if self.is_identical(local, remote, cancel).await? {
                    debug!("文件未变化，跳过: {}", remote.name);
                    report.files_unchanged += 1;
                    return Ok(false);
                }
                self.upload(local, remote_path, report, cancel).await?;
                Ok(false)
            }
            (Classification::Differ, Some(local), Some(_)) => {
                self.upload(local, remote_path, report, cancel).await?;
                Ok(false)
            }
            (class, _, _) => Err(SyncError::Other(anyhow::anyhow!(
                "比较结果不完整: {} ({:?})",
                item.name,
                class
            ))),
        }
    }

    async fn delete_remote(&self, remote: &Entry, report: &mut SyncReport) -> Result<()> {
        debug!("删除远程条目: {}", remote.remote_path());
        self.storage.delete_entry(&remote.remote_path()).await?;
        if remote.is_dir() {
            report.dirs_deleted += 1;
        } else {
            report.files_deleted += 1;
        }
        Ok(())
    }

    async fn upload(
        &self,
        local: &LocalEntry,
        remote_path: &str,
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let bytes = upload_file(self.storage.as_ref(), &local.path, remote_path, cancel).await?;
        report.files_uploaded += 1;
        report.bytes_transferred += bytes;
        Ok(())
    }

    // ============ 公共 ============

    /// 大小相同的文件用摘要确认是否一致；远程没有摘要时视为不一致
    async fn is_identical(
        &self,
        local: &LocalEntry,
        remote: &Entry,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let Some(digest) = remote.digest.as_deref() else {
            debug!("远程条目无摘要，无法比较: {}", remote.name);
            return Ok(false);
        };
        self.verifier
            .equal(&local.path, &remote.name, digest, cancel)
            .await
    }
}

/// 下载远程文件到本地路径
///
/// 先写入同目录下的隐藏临时文件，完成后重命名；失败、取消或 future 被丢弃时
/// 临时文件会被删除，目标路径不会留下不完整的文件。
pub async fn download_file(
    storage: &dyn StorageBackend,
    remote: &Entry,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_path = parent.join(format!(
        ".{}.{}.partial",
        file_name,
        uuid::Uuid::new_v4().simple()
    ));

    debug!("下载: {} -> {:?}", remote.name, target);

    let temp_guard = scopeguard::guard(temp_path, |path| {
        let _ = std::fs::remove_file(&path);
    });

    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        stream = storage.download_stream(&remote.name) => stream?,
    };

    let mut file = fs::File::create(&*temp_guard).await?;
    let mut written = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    if written != remote.size {
        return Err(SyncError::Other(anyhow::anyhow!(
            "下载大小不一致: {} (预期 {} 字节, 实际 {} 字节)",
            remote.name,
            remote.size,
            written
        )));
    }

    #[cfg(unix)]
    if remote.kind == EntryKind::ExecutableFile {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&*temp_guard, std::fs::Permissions::from_mode(0o755)).await?;
    }

    fs::rename(&*temp_guard, target).await?;
    // 已重命名，撤销清理
    let _ = scopeguard::ScopeGuard::into_inner(temp_guard);
    Ok(written)
}

/// 上传本地文件，返回字节数
pub async fn upload_file(
    storage: &dyn StorageBackend,
    local_path: &Path,
    remote_path: &str,
    cancel: &CancellationToken,
) -> Result<u64> {
    let file = fs::File::open(local_path).await?;
    let size = file.metadata().await?.len();
    debug!("上传: {:?} -> {} ({} 字节)", local_path, remote_path, size);

    let stream = ReaderStream::with_capacity(file, UPLOAD_READ_CAPACITY)
        .map(|chunk| chunk.map_err(SyncError::from))
        .boxed();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        result = storage.upload_stream(remote_path, stream, Some(size)) => result?,
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_request_defaults_to_no_delete() {
        let request = SyncRequest::new("/tmp/x");
        assert!(request.dont_delete);
        assert!(!request.clone().allow_delete().dont_delete);
        let sub = request.with_sub_path("/a/b/");
        assert_eq!(sub.remote_prefix(), "a/b");
        assert_eq!(sub.local_dir(), PathBuf::from("/tmp/x").join("a/b"));
    }

    #[tokio::test]
    async fn test_download_writes_file_and_no_partial_left() {
        let storage = MemoryStorage::new();
        storage.put("dir/data.bin", vec![5u8; 200_000]);
        let remote = storage
            .list_entries("dir")
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap();

        let local = tempfile::tempdir().unwrap();
        let target = local.path().join("data.bin");
        let written = download_file(&storage, &remote, &target, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 200_000);
        assert_eq!(std::fs::read(&target).unwrap().len(), 200_000);
        assert_eq!(std::fs::read_dir(local.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_download_leaves_nothing() {
        let storage = MemoryStorage::new();
        storage.put("data.bin", vec![1u8; 1000]);
        let remote = Entry::file("data.bin", 1000, None);

        let local = tempfile::tempdir().unwrap();
        let target = local.path().join("data.bin");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = download_file(&storage, &remote, &target, &cancel).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(std::fs::read_dir(local.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_short_download_is_removed() {
        let storage = MemoryStorage::new();
        storage.put("data.bin", vec![1u8; 10]);
        // 列表声称更大，模拟传输中断
        let remote = Entry::file("data.bin", 20, None);

        let local = tempfile::tempdir().unwrap();
        let target = local.path().join("data.bin");
        let result = download_file(&storage, &remote, &target, &CancellationToken::new()).await;
        assert!(result.is_err());
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(local.path()).unwrap().count(), 0);
    }
}
