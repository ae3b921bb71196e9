//! 内容摘要 - 单段/分段摘要格式与本地文件校验
//!
//! 远程存储的摘要有三种形态：
//! - 空值：无法比较
//! - `<32位十六进制>`（可选 `-1` 后缀）：整个对象的 MD5
//! - `<32位十六进制>-<N>`，N >= 2：分段上传，值为各段 MD5 拼接后再取 MD5

pub mod cache;
pub mod candidates;
pub mod verifier;

use md5::{Digest, Md5};

pub use cache::PartSizeCache;
pub use candidates::{candidate_part_sizes, is_consistent, PartSizePolicy, MIB};
pub use verifier::{DigestVerifier, Verdict};

/// 单段摘要的十六进制长度
pub const HASH_HEX_LEN: usize = 32;

/// 解析后的摘要
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestToken<'a> {
    /// 整体摘要，`suffixed` 表示带有 `-1` 后缀
    SinglePart { hash: &'a str, suffixed: bool },
    /// 分段摘要
    MultiPart { hash: &'a str, parts: u64 },
}

impl<'a> DigestToken<'a> {
    /// 解析摘要字符串，格式不合法时返回 None（视为不可比较）
    pub fn parse(raw: &'a str) -> Option<Self> {
        let hash = raw.get(..HASH_HEX_LEN)?;
        if !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }

        let rest = &raw[HASH_HEX_LEN..];
        if rest.is_empty() {
            return Some(DigestToken::SinglePart {
                hash,
                suffixed: false,
            });
        }

        let count = rest.strip_prefix('-')?;
        if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        match count.parse::<u64>().ok()? {
            0 => None,
            1 => Some(DigestToken::SinglePart {
                hash,
                suffixed: true,
            }),
            parts => Some(DigestToken::MultiPart { hash, parts }),
        }
    }

    /// 声明的分段数（单段摘要为 1）
    pub fn part_count(&self) -> u64 {
        match self {
            DigestToken::SinglePart { .. } => 1,
            DigestToken::MultiPart { parts, .. } => *parts,
        }
    }
}

/// 整体 MD5 摘要
pub fn single_part_digest(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// 按固定段大小计算分段摘要 `<md5(各段md5)>-<段数>`
///
/// 空数据按一个空段处理。`part_size` 为 0 时退化为单段。
pub fn composite_digest(data: &[u8], part_size: usize) -> String {
    let part_size = if part_size == 0 {
        data.len().max(1)
    } else {
        part_size
    };

    let mut concatenated = Vec::new();
    let mut parts = 0u64;
    for chunk in data.chunks(part_size) {
        concatenated.extend_from_slice(&Md5::digest(chunk));
        parts += 1;
    }
    if parts == 0 {
        concatenated.extend_from_slice(&Md5::digest(b""));
        parts = 1;
    }

    format!("{}-{}", hex::encode(Md5::digest(&concatenated)), parts)
}
