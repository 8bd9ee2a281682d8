//! 续传记录存储
//!
//! 每个 (来源 URL, 目标路径) 对应一个 JSON 文件，文件名是二者的 SHA-256。
//! 写入先落到临时文件再 rename，进程崩溃时不会留下指向不存在字节的记录。

use crate::checksum::Sha256Digest;
use crate::error::Result;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// 下载未完成时保存的状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRecord {
    pub source_url: String,
    pub destination_path: PathBuf,
    pub total_bytes: u64,
    /// 从 0 开始连续写入磁盘的字节数
    pub bytes_completed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_checksum: Option<Sha256Digest>,
    /// 写入时间（Unix 秒）
    pub timestamp: u64,
}

impl ResumeRecord {
    pub fn new(
        source_url: &str,
        destination_path: &Path,
        total_bytes: u64,
        bytes_completed: u64,
        expected_checksum: Option<Sha256Digest>,
    ) -> Self {
        Self {
            source_url: source_url.to_string(),
            destination_path: destination_path.to_path_buf(),
            total_bytes,
            bytes_completed,
            expected_checksum,
            timestamp: unix_now(),
        }
    }
}

/// 续传记录目录
#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, source_url: &str, destination: &Path) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(source_url.as_bytes());
        hasher.update([0u8]);
        hasher.update(destination.to_string_lossy().as_bytes());
        let key = hex::encode(hasher.finalize());
        self.dir.join(format!("{key}.json"))
    }

    /// 读取记录；不存在或无法解析时返回 `None`
    pub fn load(&self, source_url: &str, destination: &Path) -> Option<ResumeRecord> {
        let path = self.record_path(source_url, destination);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read resume record {:?}: {}", path, e);
                return None;
            }
        };
        match serde_json::from_str::<ResumeRecord>(&content) {
            Ok(record)
                if record.source_url == source_url
                    && record.destination_path == destination =>
            {
                Some(record)
            }
            Ok(_) => {
                warn!("Resume record {:?} belongs to another transfer", path);
                None
            }
            Err(e) => {
                warn!("Corrupt resume record {:?}: {}", path, e);
                None
            }
        }
    }

    /// 读取并校验记录
    ///
    /// 只有当部分文件仍然存在且长度不小于 `bytes_completed`、并且总大小与远端一致时
    /// 才信任该记录；否则删除记录，调用方从头开始下载。
    pub fn load_valid(
        &self,
        source_url: &str,
        destination: &Path,
        partial_path: &Path,
        remote_size: u64,
    ) -> Option<ResumeRecord> {
        let record = self.load(source_url, destination)?;
        let on_disk = fs::metadata(partial_path).map(|m| m.len()).ok();
        let trusted = match on_disk {
            Some(len) => {
                record.total_bytes == remote_size
                    && record.bytes_completed <= record.total_bytes
                    && record.bytes_completed <= len
            }
            None => false,
        };
        if trusted {
            debug!(
                "Resuming {} at {}/{} bytes",
                source_url, record.bytes_completed, record.total_bytes
            );
            Some(record)
        } else {
            warn!(
                "Discarding stale resume record for {} (partial file {:?}, {:?} bytes on disk)",
                source_url, partial_path, on_disk
            );
            let _ = self.clear(source_url, destination);
            None
        }
    }

    /// 保存记录，覆盖同一个键的旧记录
    pub fn save(&self, record: &ResumeRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.record_path(&record.source_url, &record.destination_path);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(record).map_err(std::io::Error::other)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(
            "Saved resume record {:?} ({} bytes completed)",
            path, record.bytes_completed
        );
        Ok(())
    }

    /// 删除记录，记录不存在时视为成功
    pub fn clear(&self, source_url: &str, destination: &Path) -> Result<()> {
        let path = self.record_path(source_url, destination);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Cleared resume record {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://192.168.1.20:8000/download/abc";

    fn store() -> (tempfile::TempDir, ResumeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().join("resume"));
        (dir, store)
    }

    #[test]
    fn test_save_load_clear() {
        let (dir, store) = store();
        let dest = dir.path().join("movie.mkv");
        assert!(store.load(URL, &dest).is_none());

        let record = ResumeRecord::new(URL, &dest, 1000, 450, None);
        store.save(&record).unwrap();
        assert_eq!(store.load(URL, &dest), Some(record.clone()));

        // 覆盖写
        let newer = ResumeRecord::new(URL, &dest, 1000, 600, None);
        store.save(&newer).unwrap();
        assert_eq!(store.load(URL, &dest).unwrap().bytes_completed, 600);

        store.clear(URL, &dest).unwrap();
        assert!(store.load(URL, &dest).is_none());
        // 重复删除不报错
        store.clear(URL, &dest).unwrap();
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let (dir, store) = store();
        let dest = dir.path().join("a.bin");
        store
            .save(&ResumeRecord::new(URL, &dest, 10, 5, None))
            .unwrap();
        let names: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json"));
    }

    #[test]
    fn test_keys_are_per_destination() {
        let (dir, store) = store();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        store.save(&ResumeRecord::new(URL, &a, 10, 5, None)).unwrap();
        assert!(store.load(URL, &b).is_none());
    }

    #[test]
    fn test_stale_record_discarded_when_partial_shorter() {
        let (dir, store) = store();
        let dest = dir.path().join("a.bin");
        let partial = dir.path().join("a.bin.partial");
        fs::write(&partial, vec![0u8; 100]).unwrap();

        store
            .save(&ResumeRecord::new(URL, &dest, 1000, 400, None))
            .unwrap();
        assert!(store.load_valid(URL, &dest, &partial, 1000).is_none());
        // 过期记录已被删除
        assert!(store.load(URL, &dest).is_none());
    }

    #[test]
    fn test_record_discarded_when_partial_missing_or_size_changed() {
        let (dir, store) = store();
        let dest = dir.path().join("a.bin");
        let partial = dir.path().join("a.bin.partial");

        store
            .save(&ResumeRecord::new(URL, &dest, 1000, 400, None))
            .unwrap();
        assert!(store.load_valid(URL, &dest, &partial, 1000).is_none());

        fs::write(&partial, vec![0u8; 1000]).unwrap();
        store
            .save(&ResumeRecord::new(URL, &dest, 1000, 400, None))
            .unwrap();
        assert!(store.load_valid(URL, &dest, &partial, 2000).is_none());
    }

    #[test]
    fn test_valid_record_trusted() {
        let (dir, store) = store();
        let dest = dir.path().join("a.bin");
        let partial = dir.path().join("a.bin.partial");
        fs::write(&partial, vec![0u8; 1000]).unwrap();

        let record = ResumeRecord::new(URL, &dest, 1000, 400, None);
        store.save(&record).unwrap();
        assert_eq!(store.load_valid(URL, &dest, &partial, 1000), Some(record));
    }

    #[test]
    fn test_record_json_is_human_readable() {
        let dest = PathBuf::from("/tmp/x.bin");
        let record = ResumeRecord::new(URL, &dest, 10, 5, None);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"sourceUrl\""));
        assert!(json.contains("\"bytesCompleted\":5"));
        assert!(!json.contains("expectedChecksum"));
    }
}
