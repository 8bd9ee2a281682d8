//! 共享文件注册表
//!
//! 保存本实例对外提供的文件集合。ID 由规范化后的绝对路径通过 UUID v5 派生，
//! 同一进程内对同一路径始终得到同一个 ID。注册表只在内存中，不跨重启持久化。
//!
//! 大小限制（单文件上限、总量上限）在加入时检查，服务时不再检查。

use crate::checksum::Sha256Digest;
use crate::config::{Settings, SizeVerdict, format_file_size};
use crate::error::{Result, ShareError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// 一个共享文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareEntry {
    pub id: String,
    pub absolute_path: PathBuf,
    pub display_name: String,
    pub size_bytes: u64,
    /// 修改时间（Unix 秒）
    pub modified_time: u64,
    /// 逻辑分组，空字符串表示根目录
    pub folder_path: String,
}

impl ShareEntry {
    pub fn extension(&self) -> String {
        self.absolute_path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    }

    pub fn media_kind(&self) -> MediaKind {
        MediaKind::from_extension(&self.extension())
    }
}

/// 预览时使用的媒体类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Text,
    Image,
    Document,
    Other,
}

impl MediaKind {
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "txt" | "md" | "log" | "csv" | "py" | "js" | "rs" | "html" | "css" | "json"
            | "xml" | "toml" | "yaml" | "yml" => MediaKind::Text,
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" => MediaKind::Image,
            "pdf" => MediaKind::Document,
            _ => MediaKind::Other,
        }
    }
}

/// 列表接口中的一个文件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedFile {
    pub id: String,
    pub name: String,
    /// 人类可读的大小
    pub size: String,
    pub size_bytes: u64,
    pub modified: u64,
    pub extension: String,
    pub kind: MediaKind,
    pub folder: String,
}

/// `GET /` 的响应体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareListing {
    pub files: Vec<ListedFile>,
    pub folders: Vec<String>,
}

/// 加入单个文件的结果
#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub entry: ShareEntry,
    /// 大文件警告
    pub warning: Option<String>,
}

/// 加入目录的汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderSummary {
    pub added: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
struct CachedDigest {
    size: u64,
    modified: u64,
    digest: Sha256Digest,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, ShareEntry>,
    known_paths: HashSet<PathBuf>,
    total_bytes: u64,
}

/// 共享注册表
///
/// 读多写少：列表和下载路径持有读锁，加入/移除持有写锁。
pub struct ShareRegistry {
    limits: Settings,
    max_total_size: u64,
    state: RwLock<RegistryState>,
    digests: RwLock<HashMap<String, CachedDigest>>,
}

impl ShareRegistry {
    pub fn new(settings: &Settings) -> Self {
        Self {
            limits: settings.clone(),
            max_total_size: settings.max_total_share_size_bytes(),
            state: RwLock::new(RegistryState::default()),
            digests: RwLock::new(HashMap::new()),
        }
    }

    /// 由路径派生稳定的 ID
    pub fn id_for_path(path: &Path) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, path.to_string_lossy().as_bytes()).to_string()
    }

    /// ID 的合法格式：UUID 文本
    pub fn is_well_formed_id(id: &str) -> bool {
        Uuid::parse_str(id).is_ok()
    }

    /// 加入单个文件，`folder_path` 为空表示根目录
    pub fn add_file(&self, path: &Path, folder_path: &str) -> Result<AddOutcome> {
        let absolute = fs::canonicalize(path)?;
        let metadata = fs::metadata(&absolute)?;
        if !metadata.is_file() {
            return Err(ShareError::BadRequest(format!("{absolute:?} is not a file")));
        }
        let size = metadata.len();
        let warning = match self.limits.validate_file_size(size) {
            SizeVerdict::Ok => None,
            SizeVerdict::Warn(msg) => Some(msg),
            SizeVerdict::Reject(msg) => return Err(ShareError::ShareLimit(msg)),
        };

        let id = Self::id_for_path(&absolute);
        let entry = ShareEntry {
            id: id.clone(),
            display_name: absolute
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| id.clone()),
            absolute_path: absolute.clone(),
            size_bytes: size,
            modified_time: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            folder_path: folder_path.trim_matches('/').to_string(),
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = state.entries.get(&id) {
            if existing.absolute_path == absolute {
                return Err(ShareError::BadRequest(format!(
                    "{absolute:?} is already shared"
                )));
            }
            return Err(ShareError::Forbidden(format!(
                "id collision between {:?} and {absolute:?}",
                existing.absolute_path
            )));
        }
        if state.total_bytes + size > self.max_total_size {
            return Err(ShareError::ShareLimit(format!(
                "total share size would exceed {}",
                format_file_size(self.max_total_size)
            )));
        }
        state.total_bytes += size;
        state.known_paths.insert(absolute.clone());
        state.entries.insert(id, entry.clone());
        drop(state);

        if let Some(msg) = &warning {
            warn!("{}: {}", entry.display_name, msg);
        }
        info!(
            "Added file: {} ({})",
            entry.display_name,
            format_file_size(entry.size_bytes)
        );
        Ok(AddOutcome { entry, warning })
    }

    /// 递归加入目录中的所有文件
    ///
    /// 单个文件失败（超限、重复、无法读取）只计入 `skipped`，不中断整个目录。
    pub fn add_folder(&self, dir: &Path) -> Result<FolderSummary> {
        let root = fs::canonicalize(dir)?;
        if !root.is_dir() {
            return Err(ShareError::BadRequest(format!("{root:?} is not a directory")));
        }
        let root_name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut summary = FolderSummary::default();
        let mut pending = vec![root.clone()];
        while let Some(current) = pending.pop() {
            let read_dir = match fs::read_dir(&current) {
                Ok(rd) => rd,
                Err(e) => {
                    warn!("Cannot read directory {:?}: {}", current, e);
                    continue;
                }
            };
            for item in read_dir.flatten() {
                let path = item.path();
                let Ok(file_type) = item.file_type() else {
                    summary.skipped += 1;
                    continue;
                };
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relative_parent = path
                    .parent()
                    .and_then(|p| p.strip_prefix(&root).ok())
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                let folder = if relative_parent.is_empty() {
                    root_name.clone()
                } else {
                    format!("{root_name}/{relative_parent}")
                };
                match self.add_file(&path, &folder) {
                    Ok(_) => summary.added += 1,
                    Err(e) => {
                        debug!("Skipped {:?}: {}", path, e);
                        summary.skipped += 1;
                    }
                }
            }
        }
        info!(
            "Added {} file(s) from folder {} ({} skipped)",
            summary.added, root_name, summary.skipped
        );
        Ok(summary)
    }

    /// 加入文件或目录
    pub fn add_path(&self, path: &Path) -> Result<FolderSummary> {
        if path.is_dir() {
            self.add_folder(path)
        } else {
            self.add_file(path, "").map(|_| FolderSummary {
                added: 1,
                skipped: 0,
            })
        }
    }

    /// 取消共享
    pub fn remove(&self, id: &str) -> Option<ShareEntry> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let entry = state.entries.remove(id)?;
        state.known_paths.remove(&entry.absolute_path);
        state.total_bytes -= entry.size_bytes;
        drop(state);
        self.digests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        info!("Removed file: {}", entry.display_name);
        Some(entry)
    }

    /// 清空所有共享
    pub fn clear(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = RegistryState::default();
        self.digests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("Cleared all shared files");
    }

    pub fn get(&self, id: &str) -> Option<ShareEntry> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .total_bytes
    }

    /// 所有条目，按文件夹和名称排序
    pub fn entries(&self) -> Vec<ShareEntry> {
        let mut entries: Vec<ShareEntry> = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .values()
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            (a.folder_path.as_str(), a.display_name.as_str())
                .cmp(&(b.folder_path.as_str(), b.display_name.as_str()))
        });
        entries
    }

    /// 解析 ID 并执行路径包含检查
    ///
    /// - 含路径分隔符或 `..` 等非 UUID 形式的 ID 视为构造攻击，返回 `Forbidden`
    /// - 未知 ID 返回 `NotFound`
    /// - 解析后的真实路径不在已知路径集合中（例如被替换成指向外部的符号链接）
    ///   返回 `Forbidden`
    pub fn resolve(&self, id: &str) -> Result<ShareEntry> {
        if !Self::is_well_formed_id(id) {
            return Err(ShareError::Forbidden(format!("malformed share id {id:?}")));
        }
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let entry = state
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| ShareError::NotFound(id.to_string()))?;
        drop(state);

        // 在锁外访问文件系统
        let real = fs::canonicalize(&entry.absolute_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ShareError::NotFound(id.to_string())
            } else {
                ShareError::Io(e)
            }
        })?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        // 期间可能已被取消共享
        if !state.entries.contains_key(id) {
            return Err(ShareError::NotFound(id.to_string()));
        }
        let known = state.known_paths.contains(&real);
        drop(state);
        if !known || real != entry.absolute_path || !real.is_file() {
            return Err(ShareError::Forbidden(format!(
                "{real:?} is outside the share set"
            )));
        }
        Ok(entry)
    }

    /// 生成列表数据
    pub fn listing(&self) -> ShareListing {
        let entries = self.entries();
        let folders: BTreeSet<String> = entries
            .iter()
            .filter(|e| !e.folder_path.is_empty())
            .map(|e| e.folder_path.clone())
            .collect();
        ShareListing {
            files: entries
                .into_iter()
                .map(|e| ListedFile {
                    size: format_file_size(e.size_bytes),
                    extension: e.extension(),
                    kind: e.media_kind(),
                    id: e.id,
                    name: e.display_name,
                    size_bytes: e.size_bytes,
                    modified: e.modified_time,
                    folder: e.folder_path,
                })
                .collect(),
            folders: folders.into_iter().collect(),
        }
    }

    /// 获取缓存的整文件摘要；文件大小或修改时间变化后失效
    pub fn cached_digest(&self, entry: &ShareEntry) -> Option<Sha256Digest> {
        let (size, modified) = current_stamp(&entry.absolute_path)?;
        let digests = self.digests.read().unwrap_or_else(PoisonError::into_inner);
        digests
            .get(&entry.id)
            .filter(|c| c.size == size && c.modified == modified)
            .map(|c| c.digest)
    }

    pub fn store_digest(&self, entry: &ShareEntry, digest: Sha256Digest) {
        if let Some((size, modified)) = current_stamp(&entry.absolute_path) {
            self.digests
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    entry.id.clone(),
                    CachedDigest {
                        size,
                        modified,
                        digest,
                    },
                );
        }
    }
}

fn current_stamp(path: &Path) -> Option<(u64, u64)> {
    let metadata = fs::metadata(path).ok()?;
    let modified = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    Some((metadata.len(), u64::try_from(modified).unwrap_or(u64::MAX)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MB;
    use std::sync::Arc;

    fn registry() -> ShareRegistry {
        ShareRegistry::new(&Settings::default())
    }

    #[test]
    fn test_add_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"hello").unwrap();

        let reg = registry();
        let outcome = reg.add_file(&path, "").unwrap();
        assert!(outcome.warning.is_none());
        assert_eq!(outcome.entry.size_bytes, 5);
        assert_eq!(outcome.entry.display_name, "notes.txt");

        let resolved = reg.resolve(&outcome.entry.id).unwrap();
        assert_eq!(resolved, outcome.entry);
        assert_eq!(reg.total_bytes(), 5);
    }

    #[test]
    fn test_id_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        fs::write(&path, b"x").unwrap();

        let reg = registry();
        let first = reg.add_file(&path, "").unwrap().entry.id;
        reg.remove(&first).unwrap();
        let second = reg.add_file(&path, "").unwrap().entry.id;
        assert_eq!(first, second);
    }

    #[test]
    fn test_duplicate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        fs::write(&path, b"x").unwrap();

        let reg = registry();
        reg.add_file(&path, "").unwrap();
        assert!(reg.add_file(&path, "").is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_size_limits_enforced_at_add_time() {
        let dir = tempfile::tempdir().unwrap();
        let small = dir.path().join("small.bin");
        let big = dir.path().join("big.bin");
        fs::write(&small, vec![0u8; 10]).unwrap();
        fs::File::create(&big).unwrap().set_len(2 * MB).unwrap();

        let reg = ShareRegistry::new(&Settings {
            max_file_size_mb: 1,
            ..Default::default()
        });
        assert!(matches!(
            reg.add_file(&big, ""),
            Err(ShareError::ShareLimit(_))
        ));
        reg.add_file(&small, "").unwrap();
    }

    #[test]
    fn test_total_share_limit() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        fs::File::create(&a).unwrap().set_len(700 * MB).unwrap();
        fs::File::create(&b).unwrap().set_len(700 * MB).unwrap();

        let reg = ShareRegistry::new(&Settings {
            max_total_share_size_gb: 1,
            ..Default::default()
        });
        // 单个文件都在限制内，第二个使总量超限
        reg.add_file(&a, "").unwrap();
        assert!(matches!(
            reg.add_file(&b, ""),
            Err(ShareError::ShareLimit(_))
        ));
    }

    #[test]
    fn test_large_file_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.iso");
        fs::File::create(&path).unwrap().set_len(3 * MB).unwrap();

        let reg = ShareRegistry::new(&Settings {
            warn_file_size_mb: 1,
            ..Default::default()
        });
        let outcome = reg.add_file(&path, "").unwrap();
        assert!(outcome.warning.is_some());
    }

    #[test]
    fn test_add_folder_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("photos");
        fs::create_dir_all(root.join("2024")).unwrap();
        fs::write(root.join("a.jpg"), b"a").unwrap();
        fs::write(root.join("2024").join("b.png"), b"b").unwrap();

        let reg = registry();
        let summary = reg.add_folder(&root).unwrap();
        assert_eq!(summary, FolderSummary { added: 2, skipped: 0 });

        let listing = reg.listing();
        assert_eq!(listing.files.len(), 2);
        assert_eq!(listing.folders, vec!["photos", "photos/2024"]);
        let b = listing.files.iter().find(|f| f.name == "b.png").unwrap();
        assert_eq!(b.folder, "photos/2024");
        assert_eq!(b.extension, "png");
        assert_eq!(b.kind, MediaKind::Image);
    }

    #[test]
    fn test_crafted_ids_forbidden() {
        let reg = registry();
        for crafted in [
            "../../etc/passwd",
            "..%2F..%2Fetc%2Fpasswd",
            "/etc/passwd",
            "abc/../../x",
            "",
            "C:\\Windows\\system.ini",
        ] {
            assert!(
                matches!(reg.resolve(crafted), Err(ShareError::Forbidden(_))),
                "id {crafted:?} should be forbidden"
            );
        }
        // 格式正确但未知的 ID
        let unknown = Uuid::new_v4().to_string();
        assert!(matches!(reg.resolve(&unknown), Err(ShareError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_swapped_symlink_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared.txt");
        let outside = dir.path().join("secret.txt");
        fs::write(&shared, b"public").unwrap();
        fs::write(&outside, b"secret").unwrap();

        let reg = registry();
        let id = reg.add_file(&shared, "").unwrap().entry.id;

        // 共享后把文件替换成指向外部的符号链接
        fs::remove_file(&shared).unwrap();
        std::os::unix::fs::symlink(&outside, &shared).unwrap();
        assert!(matches!(reg.resolve(&id), Err(ShareError::Forbidden(_))));
    }

    #[test]
    fn test_resolve_while_registry_changes() {
        let dir = tempfile::tempdir().unwrap();
        let stable = dir.path().join("stable.txt");
        fs::write(&stable, b"stay").unwrap();
        let reg = Arc::new(registry());
        let id = reg.add_file(&stable, "").unwrap().entry.id;

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reg = reg.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        assert_eq!(reg.resolve(&id).unwrap().display_name, "stable.txt");
                    }
                })
            })
            .collect();
        for i in 0..50 {
            let path = dir.path().join(format!("churn-{i}.txt"));
            fs::write(&path, b"x").unwrap();
            let churn = reg.add_file(&path, "").unwrap().entry.id;
            reg.remove(&churn).unwrap();
            assert!(matches!(reg.resolve(&churn), Err(ShareError::NotFound(_))));
        }
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"aa").unwrap();
        fs::write(&b, b"bbb").unwrap();

        let reg = registry();
        let id = reg.add_file(&a, "").unwrap().entry.id;
        reg.add_file(&b, "").unwrap();
        assert_eq!(reg.total_bytes(), 5);

        assert!(reg.remove(&id).is_some());
        assert!(reg.remove(&id).is_none());
        assert_eq!(reg.total_bytes(), 3);

        reg.clear();
        assert!(reg.is_empty());
        assert_eq!(reg.total_bytes(), 0);
    }

    #[test]
    fn test_digest_cache_invalidated_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"one").unwrap();

        let reg = registry();
        let entry = reg.add_file(&path, "").unwrap().entry;
        assert!(reg.cached_digest(&entry).is_none());

        let digest = crate::checksum::compute_file_digest(&path).unwrap();
        reg.store_digest(&entry, digest);
        assert_eq!(reg.cached_digest(&entry), Some(digest));

        fs::write(&path, b"changed").unwrap();
        assert!(reg.cached_digest(&entry).is_none());
    }
}
