//! 分段传输规划
//!
//! 根据文件大小和配置决定块大小、线程数，以及每个线程负责的字节区间。
//! 所有函数都是纯函数。
//!
//! 不变量：`ThreadPlan` 中的区间按顺序首尾相接，并集恰好是 `[0, file_size)`
//! （续传计划则是 `[start, file_size)`）。多线程写入同一个目标文件的安全性
//! 完全依赖这一点。

use crate::config::{GB, MB, Settings};
use serde::{Deserialize, Serialize};

/// 半开字节区间 `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// HTTP Range 头，使用闭区间表示
    pub fn to_header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

/// 一次下载的线程规划
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPlan {
    /// 每个线程内部读写使用的块大小
    pub chunk_size: u64,
    /// 每个线程一个区间，按偏移排序
    pub ranges: Vec<ByteRange>,
}

impl ThreadPlan {
    pub fn thread_count(&self) -> usize {
        self.ranges.len()
    }

    /// 规划覆盖的总字节数
    pub fn total_bytes(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// 续传计划：单个区间覆盖 `[start, total)`
    pub fn resume_suffix(start: u64, total: u64, chunk_size: u64) -> Self {
        let ranges = if start < total {
            vec![ByteRange::new(start, total)]
        } else {
            Vec::new()
        };
        Self { chunk_size, ranges }
    }
}

/// 按文件大小选择块大小
pub fn chunk_size_for(file_size: u64, settings: &Settings) -> u64 {
    if file_size < 10 * MB {
        settings.chunk_size_small
    } else if file_size < 100 * MB {
        settings.chunk_size_medium
    } else if file_size < GB {
        settings.chunk_size_large
    } else {
        settings.chunk_size_xlarge
    }
}

/// 是否使用多线程下载
pub fn should_use_multithread(file_size: u64, settings: &Settings) -> bool {
    settings.enable_multithreaded_download && file_size >= settings.min_file_size_for_multithread
}

/// 计算线程数
pub fn thread_count_for(file_size: u64, settings: &Settings) -> usize {
    if !should_use_multithread(file_size, settings) {
        return 1;
    }
    let chunk_size = chunk_size_for(file_size, settings).max(1);
    let chunks = file_size.div_ceil(chunk_size);
    let cap = settings
        .max_download_threads
        .clamp(1, crate::config::MAX_DOWNLOAD_THREADS_LIMIT);
    usize::try_from(chunks).map_or(cap, |c| c.min(cap)).max(1)
}

/// 把 `[0, file_size)` 切分成 `threads` 个连续区间
///
/// 最后一个区间吸收整除余数。空文件得到一个空区间。
pub fn partition(file_size: u64, threads: usize) -> Vec<ByteRange> {
    let threads = threads.max(1) as u64;
    let base = file_size / threads;
    if base == 0 {
        return vec![ByteRange::new(0, file_size)];
    }
    (0..threads)
        .map(|i| {
            let start = i * base;
            let end = if i == threads - 1 {
                file_size
            } else {
                start + base
            };
            ByteRange::new(start, end)
        })
        .collect()
}

/// 生成完整的下载规划
pub fn plan(file_size: u64, settings: &Settings) -> ThreadPlan {
    let chunk_size = chunk_size_for(file_size, settings);
    let threads = thread_count_for(file_size, settings);
    ThreadPlan {
        chunk_size,
        ranges: partition(file_size, threads),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KB;

    fn assert_exact_partition(ranges: &[ByteRange], file_size: u64) {
        assert!(!ranges.is_empty());
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges.last().unwrap().end, file_size);
        for pair in ranges.windows(2) {
            // 无缝隙、无重叠
            assert_eq!(pair[0].end, pair[1].start);
        }
        let sum: u64 = ranges.iter().map(ByteRange::len).sum();
        assert_eq!(sum, file_size);
    }

    #[test]
    fn test_chunk_size_tiers() {
        let s = Settings::default();
        assert_eq!(chunk_size_for(5 * MB, &s), 8 * KB);
        assert_eq!(chunk_size_for(10 * MB, &s), 64 * KB);
        assert_eq!(chunk_size_for(50 * MB, &s), 64 * KB);
        assert_eq!(chunk_size_for(100 * MB, &s), 512 * KB);
        assert_eq!(chunk_size_for(2 * GB, &s), MB);
    }

    #[test]
    fn test_small_file_single_thread() {
        let p = plan(5 * MB, &Settings::default());
        assert_eq!(p.thread_count(), 1);
        assert_eq!(p.chunk_size, 8 * KB);
        assert_eq!(p.ranges, vec![ByteRange::new(0, 5 * MB)]);
    }

    #[test]
    fn test_fifty_megabytes_four_threads() {
        let settings = Settings {
            enable_multithreaded_download: true,
            max_download_threads: 4,
            ..Default::default()
        };
        let p = plan(50 * MB, &settings);
        assert_eq!(p.thread_count(), 4);
        assert_eq!(p.chunk_size, 64 * KB);
        assert_eq!(p.total_bytes(), 50 * MB);
        assert_exact_partition(&p.ranges, 50 * MB);
    }

    #[test]
    fn test_multithread_disabled() {
        let settings = Settings {
            enable_multithreaded_download: false,
            ..Default::default()
        };
        assert_eq!(plan(500 * MB, &settings).thread_count(), 1);
    }

    #[test]
    fn test_threads_capped_by_chunk_count() {
        let settings = Settings {
            min_file_size_for_multithread: 0,
            max_download_threads: 16,
            ..Default::default()
        };
        // 3 个 8 KB 块最多 3 个线程
        assert_eq!(thread_count_for(3 * 8 * KB, &settings), 3);
        assert_eq!(thread_count_for(0, &settings), 1);
    }

    #[test]
    fn test_partition_is_exact_for_many_sizes() {
        let sizes = [0u64, 1, 2, 3, 7, 1023, 4096, 10 * MB + 3, 50 * MB, 1_000_000_007];
        for size in sizes {
            for threads in 1..=16 {
                let ranges = partition(size, threads);
                if size == 0 {
                    assert_eq!(ranges, vec![ByteRange::new(0, 0)]);
                    continue;
                }
                assert_exact_partition(&ranges, size);
                assert!(ranges.len() <= threads);
            }
        }
    }

    #[test]
    fn test_last_range_absorbs_remainder() {
        let ranges = partition(10, 3);
        assert_eq!(
            ranges,
            vec![
                ByteRange::new(0, 3),
                ByteRange::new(3, 6),
                ByteRange::new(6, 10)
            ]
        );
    }

    #[test]
    fn test_resume_suffix() {
        let p = ThreadPlan::resume_suffix(400, 1000, 8 * KB);
        assert_eq!(p.ranges, vec![ByteRange::new(400, 1000)]);
        assert!(ThreadPlan::resume_suffix(1000, 1000, 8 * KB).ranges.is_empty());
    }

    #[test]
    fn test_range_header() {
        assert_eq!(ByteRange::new(0, 100).to_header_value(), "bytes=0-99");
    }
}
