use super::{ByteStream, StorageBackend};
use crate::entry::{join_path, normalize_path, Entry, EntryKind};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use futures::StreamExt;
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use walkdir::WalkDir;

/// 以本地目录作为"远程"存储（例如挂载的网络盘）
///
/// 文件系统不提供摘要，列出时为每个文件计算整体 MD5。
pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    pub fn new(path: &str) -> Result<Self> {
        let base_path = PathBuf::from(path);
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", path);
        Ok(Self { base_path, name })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = normalize_path(path);
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    async fn file_digest(path: &Path) -> Result<String> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

/// 列出本地目录下一级条目（文件、可执行文件、子目录）
pub async fn list_local_dir(dir: &Path, prefix: &str) -> Result<Vec<(Entry, PathBuf)>> {
    match fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Err(SyncError::NotFound(dir.display().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SyncError::NotFound(dir.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    }

    let dir = dir.to_path_buf();
    let prefix = prefix.to_string();

    // 使用 spawn_blocking 避免阻塞 async runtime
    let entries = tokio::task::spawn_blocking(move || -> Result<Vec<(Entry, PathBuf)>> {
        let mut entries = Vec::new();
        for item in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name()
        {
            let item = item.map_err(|e| SyncError::Other(e.into()))?;
            let Some(file_name) = item.file_name().to_str() else {
                tracing::warn!("跳过非 UTF-8 文件名: {:?}", item.path());
                continue;
            };
            let metadata = item.metadata().map_err(|e| SyncError::Other(e.into()))?;
            let name = join_path(&prefix, file_name);

            let entry = if metadata.is_dir() {
                Entry::directory(&name)
            } else {
                Entry::file(&name, metadata.len(), None).with_kind(file_kind(&metadata))
            };
            entries.push((entry, item.path().to_path_buf()));
        }
        Ok(entries)
    })
    .await
    .map_err(|e| SyncError::Other(e.into()))??;

    Ok(entries)
}

#[cfg(unix)]
fn file_kind(metadata: &std::fs::Metadata) -> EntryKind {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        EntryKind::ExecutableFile
    } else {
        EntryKind::File
    }
}

#[cfg(not(unix))]
fn file_kind(_metadata: &std::fs::Metadata) -> EntryKind {
    EntryKind::File
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn list_entries(&self, prefix: &str) -> Result<Vec<Entry>> {
        let dir = self.resolve_path(prefix);
        let listed = list_local_dir(&dir, prefix).await?;

        let mut entries = Vec::with_capacity(listed.len());
        for (entry, path) in listed {
            if entry.is_file() {
                let digest = Self::file_digest(&path).await?;
                entries.push(Entry {
                    digest: Some(digest),
                    ..entry
                });
            } else {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn upload_stream(
        &self,
        path: &str,
        mut stream: ByteStream,
        _size_hint: Option<u64>,
    ) -> Result<()> {
        let full_path = self.resolve_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 写入同目录下的隐藏临时文件，完成后重命名；出错、取消或被丢弃时删除临时文件
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = full_path.with_file_name(format!(
            ".{}.{}.partial",
            file_name,
            uuid::Uuid::new_v4().simple()
        ));
        let temp_guard = scopeguard::guard(temp_path, |path| {
            let _ = std::fs::remove_file(&path);
        });

        let mut file = fs::File::create(&*temp_guard).await?;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        drop(file);

        fs::rename(&*temp_guard, &full_path).await?;
        let _ = scopeguard::ScopeGuard::into_inner(temp_guard);
        Ok(())
    }

    async fn download_stream(&self, path: &str) -> Result<ByteStream> {
        let file = fs::File::open(self.resolve_path(path)).await?;
        let stream = ReaderStream::new(file).map(|chunk| chunk.map_err(SyncError::from));
        Ok(stream.boxed())
    }

    async fn delete_entry(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);

        match fs::metadata(&full_path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&full_path).await?,
            Ok(_) => fs::remove_file(&full_path).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
