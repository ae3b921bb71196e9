//! 分段大小候选值枚举
//!
//! 远程分段摘要只暴露段数，不暴露上传时的段大小。
//! 根据 (文件大小, 段数) 推算可能的段大小，供校验时逐一重放。

pub const MIB: u64 = 1024 * 1024;

/// 同时跟踪的猜测候选数上限（超过则放大步长）
const MAX_GUESS_CANDIDATES: u64 = 10;
/// 步长放大倍数
const STEP_GROWTH: u64 = 5;

/// 分段大小策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSizePolicy {
    /// 默认上传段大小，<= 0 表示不分段
    pub default_part_size: i64,
    /// 已知的段大小列表，<= 0 的项表示"尝试猜测其它段大小"
    pub available_part_sizes: Vec<i64>,
}

impl Default for PartSizePolicy {
    fn default() -> Self {
        Self {
            default_part_size: 8 * MIB as i64,
            available_part_sizes: vec![5 * MIB as i64, 8 * MIB as i64, 16 * MIB as i64, 0],
        }
    }
}

impl PartSizePolicy {
    /// 是否包含猜测标记
    pub fn allows_guessing(&self) -> bool {
        self.available_part_sizes.iter().any(|&s| s <= 0)
    }
}

/// 段大小是否能产生给定段数
pub fn is_consistent(file_size: u64, part_size: u64, part_count: u64) -> bool {
    part_size > 0 && file_size.div_ceil(part_size) == part_count
}

/// 按优先级枚举候选段大小：默认段大小、已知段大小、猜测值
///
/// 结果去重并保持顺序，只包含与 (file_size, part_count) 一致的值。
pub fn candidate_part_sizes(file_size: u64, part_count: u64, policy: &PartSizePolicy) -> Vec<u64> {
    let mut candidates: Vec<u64> = Vec::new();
    let mut push = |size: u64| {
        if is_consistent(file_size, size, part_count) && !candidates.contains(&size) {
            candidates.push(size);
        }
    };

    if policy.default_part_size > 0 {
        push(policy.default_part_size as u64);
    }

    for &size in policy.available_part_sizes.iter().filter(|&&s| s > 0) {
        push(size as u64);
    }

    if policy.allows_guessing() {
        for size in guessed_part_sizes(file_size, part_count) {
            push(size);
        }
    }

    candidates
}

/// 在 [size/N, size/(N-1)] 区间内按 MiB 对齐步长生成猜测值
fn guessed_part_sizes(file_size: u64, part_count: u64) -> Vec<u64> {
    if part_count < 2 {
        return Vec::new();
    }

    let min = file_size / part_count;
    let max = file_size / (part_count - 1);
    if max <= min {
        return Vec::new();
    }

    let range_mib = (max - min) / MIB;
    let mut step_mib = 1;
    while range_mib / step_mib >= MAX_GUESS_CANDIDATES {
        step_mib *= STEP_GROWTH;
    }
    let step = step_mib * MIB;

    let mut size = min.div_ceil(step).max(1) * step;
    let mut guesses = Vec::new();
    while size <= max {
        guesses.push(size);
        size += step;
    }
    guesses
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(default_part_size: i64, sizes: &[i64]) -> PartSizePolicy {
        PartSizePolicy {
            default_part_size,
            available_part_sizes: sizes.to_vec(),
        }
    }

    #[test]
    fn test_consistency_check() {
        assert!(is_consistent(10 * MIB, 5 * MIB, 2));
        assert!(is_consistent(11 * MIB, 5 * MIB, 3));
        assert!(!is_consistent(10 * MIB, 5 * MIB, 3));
        assert!(!is_consistent(10 * MIB, 0, 2));
        assert!(!is_consistent(0, 5 * MIB, 2));
    }

    #[test]
    fn test_default_and_known_sizes_filtered() {
        let p = policy(8 * MIB as i64, &[5 * MIB as i64, 16 * MIB as i64]);
        // 20 MiB / 5 MiB = 4 段，只有 5 MiB 一致
        assert_eq!(candidate_part_sizes(20 * MIB, 4, &p), vec![5 * MIB]);
        // 20 MiB / 8 MiB = 3 段
        assert_eq!(candidate_part_sizes(20 * MIB, 3, &p), vec![8 * MIB]);
        // 20 MiB / 16 MiB = 2 段
        assert_eq!(candidate_part_sizes(20 * MIB, 2, &p), vec![16 * MIB]);
        assert!(candidate_part_sizes(20 * MIB, 7, &p).is_empty());
    }

    #[test]
    fn test_duplicates_removed_in_order() {
        let p = policy(5 * MIB as i64, &[5 * MIB as i64, 5 * MIB as i64]);
        assert_eq!(candidate_part_sizes(12 * MIB, 3, &p), vec![5 * MIB]);
    }

    #[test]
    fn test_guessing_requires_sentinel() {
        let without = policy(0, &[5 * MIB as i64]);
        assert!(candidate_part_sizes(30 * MIB, 4, &without).is_empty());

        let with = policy(0, &[5 * MIB as i64, -1]);
        let guesses = candidate_part_sizes(30 * MIB, 4, &with);
        assert!(!guesses.is_empty());
        assert!(guesses.iter().all(|&s| is_consistent(30 * MIB, s, 4)));
        // 30 MiB 分 4 段：8 MiB、9 MiB 都可能
        assert!(guesses.contains(&(8 * MIB)));
        assert!(guesses.contains(&(9 * MIB)));
    }

    #[test]
    fn test_guess_count_is_bounded() {
        let p = policy(0, &[0]);
        for (size, parts) in [(10_000 * MIB, 2), (123_456 * MIB, 3), (777 * MIB, 2)] {
            let guesses = candidate_part_sizes(size, parts, &p);
            assert!(!guesses.is_empty());
            assert!(guesses.len() <= 11, "too many guesses: {}", guesses.len());
        }
    }
}
