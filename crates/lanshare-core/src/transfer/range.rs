//! HTTP Range 头解析
//!
//! 只支持单个区间：`bytes=a-b`、`bytes=a-`、`bytes=-n`。多区间请求视为格式错误。

use crate::error::{Result, ShareError};
use crate::planner::ByteRange;
use regex::Regex;
use std::sync::LazyLock;

static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*bytes\s*=\s*(\d*)\s*-\s*(\d*)\s*$").expect("valid range regex")
});

/// 解析 Range 头，得到 `[start, end)` 区间
///
/// - 格式错误返回 `BadRequest`（400）
/// - 起点超出文件或后缀长度为 0 返回 `RangeNotSatisfiable`（416）
/// - 终点超出文件时截断到文件末尾
pub fn parse_range(header: &str, file_size: u64) -> Result<ByteRange> {
    let caps = RANGE_RE
        .captures(header)
        .ok_or_else(|| ShareError::BadRequest(format!("malformed Range header {header:?}")))?;
    let first = parse_number(&caps[1], header)?;
    let last = parse_number(&caps[2], header)?;

    let unsatisfiable = ShareError::RangeNotSatisfiable { size: file_size };
    match (first, last) {
        (Some(start), Some(end)) => {
            if end < start {
                return Err(ShareError::BadRequest(format!(
                    "Range end before start in {header:?}"
                )));
            }
            if start >= file_size {
                return Err(unsatisfiable);
            }
            Ok(ByteRange::new(start, end.saturating_add(1).min(file_size)))
        }
        (Some(start), None) => {
            if start >= file_size {
                return Err(unsatisfiable);
            }
            Ok(ByteRange::new(start, file_size))
        }
        (None, Some(suffix)) => {
            if suffix == 0 || file_size == 0 {
                return Err(unsatisfiable);
            }
            Ok(ByteRange::new(file_size.saturating_sub(suffix), file_size))
        }
        (None, None) => Err(ShareError::BadRequest(format!(
            "empty Range in {header:?}"
        ))),
    }
}

fn parse_number(digits: &str, header: &str) -> Result<Option<u64>> {
    if digits.is_empty() {
        return Ok(None);
    }
    digits
        .parse()
        .map(Some)
        .map_err(|_| ShareError::BadRequest(format!("Range value overflow in {header:?}")))
}

/// `Content-Range` 响应头
pub fn content_range(range: &ByteRange, file_size: u64) -> String {
    format!(
        "bytes {}-{}/{}",
        range.start,
        range.end.saturating_sub(1),
        file_size
    )
}
