//! 校验和计算
//!
//! 整文件和字节区间都使用 SHA-256，按固定大小的块流式读取，
//! 不会把整个文件读入内存。

use crate::error::{Result, ShareError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;

/// 读取块大小
const BLOCK_SIZE: usize = 64 * 1024;

/// 校验算法名称（出现在 `/checksum` 响应中）
pub const ALGORITHM: &str = "sha256";

/// SHA-256 摘要
///
/// 序列化为小写十六进制字符串。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sha256Digest([u8; 32]);

impl Sha256Digest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Digest({})", self.to_hex())
    }
}

impl FromStr for Sha256Digest {
    type Err = ShareError;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| ShareError::BadRequest(format!("invalid sha256 digest: {e}")))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Sha256Digest {
    type Error = ShareError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Sha256Digest> for String {
    fn from(value: Sha256Digest) -> Self {
        value.to_hex()
    }
}

/// 计算整个文件的摘要
pub fn compute_file_digest(path: &Path) -> Result<Sha256Digest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BLOCK_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(Sha256Digest(hasher.finalize().into()))
}

/// 计算 `[start, end)` 区间的摘要
///
/// 区间超出文件末尾时返回 `UnexpectedEof`，避免把短文件当成完整分段。
pub fn compute_range_digest(path: &Path, start: u64, end: u64) -> Result<Sha256Digest> {
    if end < start {
        return Err(ShareError::BadRequest(format!(
            "invalid range {start}..{end}"
        )));
    }
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BLOCK_SIZE];
    let mut remaining = end - start;
    while remaining > 0 {
        let want = usize::try_from(remaining).map_or(BLOCK_SIZE, |r| r.min(BLOCK_SIZE));
        let n = file.read(&mut buffer[..want])?;
        if n == 0 {
            return Err(ShareError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{path:?} ends before byte {end}"),
            )));
        }
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }
    Ok(Sha256Digest(hasher.finalize().into()))
}

/// 比较两个摘要
///
/// 逐字节异或累积，耗时与内容无关。
pub fn verify(expected: &Sha256Digest, actual: &Sha256Digest) -> bool {
    expected
        .0
        .iter()
        .zip(actual.0.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// 摘要不一致时返回 [`ShareError::Integrity`]
pub fn ensure_match(path: &Path, expected: &Sha256Digest, actual: &Sha256Digest) -> Result<()> {
    if verify(expected, actual) {
        Ok(())
    } else {
        Err(ShareError::Integrity {
            path: path.to_path_buf(),
            expected: expected.to_hex(),
            actual: actual.to_hex(),
        })
    }
}
