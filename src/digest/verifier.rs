//! 本地文件与远程摘要的一致性校验
//!
//! 分段摘要的段大小未知时，对所有候选段大小共享一次顺序读取：
//! 每次读取都截断到最近的段边界，到达边界的候选结束当前段并开始下一段。

use super::cache::PartSizeCache;
use super::candidates::{candidate_part_sizes, PartSizePolicy, MIB};
use super::DigestToken;
use crate::error::{Result, SyncError};
use md5::{Digest, Md5};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 默认读取缓冲区大小
pub const DEFAULT_READ_BUFFER: usize = MIB as usize;

/// 校验结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub equal: bool,
    /// 复现分段摘要的段大小（仅分段匹配时有值）
    pub part_size: Option<u64>,
}

impl Verdict {
    fn mismatch() -> Self {
        Self {
            equal: false,
            part_size: None,
        }
    }

    fn matched(part_size: Option<u64>) -> Self {
        Self {
            equal: true,
            part_size,
        }
    }
}

/// 单个候选段大小的滚动状态
struct PartAccumulator {
    part_size: u64,
    next_boundary: u64,
    hasher: Md5,
    pending: bool,
    /// 已完成段的摘要依次拼接
    part_digests: Vec<u8>,
    parts: u64,
}

impl PartAccumulator {
    fn new(part_size: u64, file_size: u64) -> Self {
        Self {
            part_size,
            next_boundary: part_size.min(file_size),
            hasher: Md5::new(),
            pending: false,
            part_digests: Vec::new(),
            parts: 0,
        }
    }

    fn finish_part(&mut self) {
        self.part_digests
            .extend_from_slice(&self.hasher.finalize_reset());
        self.parts += 1;
        self.pending = false;
    }

    /// 收尾：空文件或末段未在边界结束时补一次
    fn finish(mut self) -> Vec<u8> {
        if self.pending || self.parts == 0 {
            self.finish_part();
        }
        self.part_digests
    }
}

/// 摘要校验器
pub struct DigestVerifier {
    policy: PartSizePolicy,
    read_buffer_size: usize,
    cache: Arc<PartSizeCache>,
}

impl DigestVerifier {
    pub fn new(policy: PartSizePolicy) -> Self {
        Self {
            policy,
            read_buffer_size: DEFAULT_READ_BUFFER,
            cache: Arc::new(PartSizeCache::new()),
        }
    }

    /// 共享外部的段大小缓存
    pub fn with_cache(mut self, cache: Arc<PartSizeCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_read_buffer(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn policy(&self) -> &PartSizePolicy {
        &self.policy
    }

    pub fn cache(&self) -> &Arc<PartSizeCache> {
        &self.cache
    }

    /// 判断本地文件是否与远程条目一致，匹配时记录发现的段大小
    ///
    /// `remote_path` 只用作缓存键。摘要不可比较时返回 false 而不是错误。
    pub async fn equal(
        &self,
        local_file: &Path,
        remote_path: &str,
        remote_digest: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if let Some(hint) = self.cache.get(remote_path, remote_digest).await {
            let verdict = self
                .verify_with(local_file, remote_digest, Some(&[hint]), cancel)
                .await?;
            if verdict.equal {
                debug!("段大小缓存命中: {} ({} 字节)", remote_path, hint);
                return Ok(true);
            }
            self.cache.forget(remote_path, remote_digest).await;
        }

        let verdict = self.verify(local_file, remote_digest, cancel).await?;
        if let Some(part_size) = verdict.part_size {
            self.cache
                .record(remote_path, remote_digest, part_size)
                .await;
        }
        Ok(verdict.equal)
    }

    /// 校验并返回结果详情，不读写缓存
    pub async fn verify(
        &self,
        local_file: &Path,
        remote_digest: &str,
        cancel: &CancellationToken,
    ) -> Result<Verdict> {
        self.verify_with(local_file, remote_digest, None, cancel)
            .await
    }

    async fn verify_with(
        &self,
        local_file: &Path,
        remote_digest: &str,
        forced_candidates: Option<&[u64]>,
        cancel: &CancellationToken,
    ) -> Result<Verdict> {
        let Some(token) = DigestToken::parse(remote_digest) else {
            debug!("摘要不可比较: {:?}", remote_digest);
            return Ok(Verdict::mismatch());
        };

        let file_size = tokio::fs::metadata(local_file).await?.len();

        match token {
            DigestToken::SinglePart { suffixed, .. } => {
                let mut digests = self
                    .hash_parts(local_file, file_size, &[file_size], cancel)
                    .await?;
                let whole = hex::encode(digests.remove(0));
                let local_digest = if suffixed {
                    format!("{}-1", whole)
                } else {
                    whole
                };
                if local_digest == remote_digest {
                    Ok(Verdict::matched(None))
                } else {
                    Ok(Verdict::mismatch())
                }
            }
            DigestToken::MultiPart { parts, .. } => {
                let candidates = match forced_candidates {
                    Some(forced) => forced.to_vec(),
                    None => candidate_part_sizes(file_size, parts, &self.policy),
                };
                if candidates.is_empty() {
                    debug!(
                        "无可用段大小候选: {:?} ({} 字节, {} 段)",
                        local_file, file_size, parts
                    );
                    return Ok(Verdict::mismatch());
                }

                debug!(
                    "分段校验 {:?}: {} 段, 候选 {:?}",
                    local_file, parts, candidates
                );

                let all_digests = self
                    .hash_parts(local_file, file_size, &candidates, cancel)
                    .await?;

                for (part_size, part_digests) in candidates.iter().zip(all_digests) {
                    let composite = format!("{}-{}", hex::encode(Md5::digest(&part_digests)), parts);
                    if composite == remote_digest {
                        return Ok(Verdict::matched(Some(*part_size)));
                    }
                }
                Ok(Verdict::mismatch())
            }
        }
    }

    /// 一次顺序读取，为每个候选段大小生成各段摘要的拼接
    async fn hash_parts(
        &self,
        local_file: &Path,
        file_size: u64,
        part_sizes: &[u64],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>> {
        let mut file = tokio::fs::File::open(local_file).await?;
        let mut accumulators: Vec<PartAccumulator> = part_sizes
            .iter()
            .map(|&size| PartAccumulator::new(size, file_size))
            .collect();
        let mut buffer = vec![0u8; self.read_buffer_size];
        let mut offset = 0u64;

        while offset < file_size {
            let nearest = accumulators
                .iter()
                .map(|a| a.next_boundary)
                .filter(|&b| b > offset)
                .min()
                .unwrap_or(file_size);
            let want = (nearest - offset).min(buffer.len() as u64) as usize;

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                read = file.read(&mut buffer[..want]) => read?,
            };
            if read == 0 {
                return Err(SyncError::TruncatedRead {
                    path: local_file.display().to_string(),
                    offset,
                    expected: file_size,
                });
            }

            let chunk = &buffer[..read];
            offset += read as u64;

            for acc in accumulators.iter_mut() {
                acc.hasher.update(chunk);
                acc.pending = true;
                if acc.next_boundary == offset {
                    acc.finish_part();
                    acc.next_boundary = (acc.next_boundary + acc.part_size).min(file_size);
                }
            }
        }

        Ok(accumulators.into_iter().map(PartAccumulator::finish).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{composite_digest, single_part_digest};
    use std::io::Write;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn write_temp(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    fn verifier(default_part_size: i64, sizes: &[i64]) -> DigestVerifier {
        DigestVerifier::new(PartSizePolicy {
            default_part_size,
            available_part_sizes: sizes.to_vec(),
        })
        .with_read_buffer(64 * 1024)
    }

    #[tokio::test]
    async fn test_single_part_match() {
        let data = sample(300_000);
        let file = write_temp(&data);
        let v = verifier(0, &[]);
        let cancel = CancellationToken::new();

        let plain = single_part_digest(&data);
        assert!(v.equal(file.path(), "f", &plain, &cancel).await.unwrap());
        let suffixed = format!("{}-1", plain);
        assert!(v.equal(file.path(), "f", &suffixed, &cancel).await.unwrap());

        let mut changed = data.clone();
        changed[1234] ^= 0xff;
        let other = single_part_digest(&changed);
        assert!(!v.equal(file.path(), "f", &other, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_file_single_part() {
        let file = write_temp(&[]);
        let v = verifier(0, &[]);
        let digest = single_part_digest(&[]);
        let verdict = v
            .verify(file.path(), &digest, &CancellationToken::new())
            .await
            .unwrap();
        assert!(verdict.equal);
    }

    #[tokio::test]
    async fn test_malformed_digest_is_not_comparable() {
        let file = write_temp(b"hello");
        let v = verifier(0, &[0]);
        let cancel = CancellationToken::new();
        for digest in ["", "abc", "5d41402abc4b2a76b9719d911017c592-", "5d41402abc4b2a76b9719d911017c592-0"] {
            assert!(!v.equal(file.path(), "f", digest, &cancel).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_multipart_known_part_size() {
        let part = 100_000usize;
        let data = sample(part * 3 + 4321);
        let file = write_temp(&data);
        let digest = composite_digest(&data, part);
        assert!(digest.ends_with("-4"));

        let v = verifier(0, &[70_000, part as i64, 130_000]);
        let cancel = CancellationToken::new();
        let verdict = v.verify(file.path(), &digest, &cancel).await.unwrap();
        assert_eq!(verdict, Verdict::matched(Some(part as u64)));

        assert!(v.equal(file.path(), "dir/a.bin", &digest, &cancel).await.unwrap());
        assert_eq!(v.cache().get("dir/a.bin", &digest).await, Some(part as u64));
    }

    #[tokio::test]
    async fn test_multipart_default_part_size() {
        let part = 50_000usize;
        let data = sample(part * 2);
        let file = write_temp(&data);
        let digest = composite_digest(&data, part);
        assert!(digest.ends_with("-2"));

        let v = verifier(part as i64, &[]);
        let verdict = v
            .verify(file.path(), &digest, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(verdict.part_size, Some(part as u64));
    }

    #[tokio::test]
    async fn test_multipart_found_by_guessing() {
        let part = MIB as usize;
        let data = sample(part * 2 + part / 2);
        let file = write_temp(&data);
        let digest = composite_digest(&data, part);
        assert!(digest.ends_with("-3"));

        let v = verifier(0, &[7 * MIB as i64, 0]);
        let verdict = v
            .verify(file.path(), &digest, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::matched(Some(MIB)));
    }

    #[tokio::test]
    async fn test_multipart_different_content_never_matches() {
        let part = 100_000usize;
        let data = sample(part * 2 + 10);
        let mut other = data.clone();
        other[part + 5] ^= 1;
        let file = write_temp(&other);
        let digest = composite_digest(&data, part);

        let v = verifier(part as i64, &[part as i64, 0]);
        let cancel = CancellationToken::new();
        assert!(!v.equal(file.path(), "x", &digest, &cancel).await.unwrap());
        assert!(v.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_multipart_without_candidates() {
        let data = sample(1000);
        let file = write_temp(&data);
        let digest = composite_digest(&data, 400);
        let v = verifier(0, &[]);
        let verdict = v
            .verify(file.path(), &digest, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!verdict.equal);
    }

    #[tokio::test]
    async fn test_stale_cache_hint_falls_back() {
        let part = 40_000usize;
        let data = sample(part * 3);
        let file = write_temp(&data);
        let digest = composite_digest(&data, part);

        let v = verifier(0, &[part as i64]);
        v.cache().record("k", &digest, 45_000).await;
        let cancel = CancellationToken::new();
        assert!(v.equal(file.path(), "k", &digest, &cancel).await.unwrap());
        assert_eq!(v.cache().get("k", &digest).await, Some(part as u64));
    }

    #[tokio::test]
    async fn test_cancelled_before_read() {
        let data = sample(10_000);
        let file = write_temp(&data);
        let v = verifier(0, &[]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = v
            .verify(file.path(), &single_part_digest(&data), &cancel)
            .await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let v = verifier(0, &[]);
        let result = v
            .verify(
                Path::new("/nonexistent/foldersync/file.bin"),
                "d41d8cd98f00b204e9800998ecf8427e",
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(SyncError::Io(_))));
    }

    #[tokio::test]
    async fn test_file_shorter_than_expected_is_truncated_read() {
        let data = sample(100_000);
        let file = write_temp(&data);
        let v = verifier(0, &[]);

        let result = v
            .hash_parts(file.path(), 150_000, &[150_000, 64 * 1024], &CancellationToken::new())
            .await;
        match result {
            Err(SyncError::TruncatedRead {
                offset, expected, ..
            }) => {
                assert_eq!(offset, 100_000);
                assert_eq!(expected, 150_000);
            }
            other => panic!("unexpected result: {:?}", other.map(|p| p.len())),
        }
    }
}
