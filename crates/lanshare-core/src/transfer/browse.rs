//! 浏览对端的共享列表
//!
//! 列表由 [`DownloadClient::fetch_listing`](super::DownloadClient::fetch_listing) 获取，
//! 这里负责搜索、拼接下载地址和本地保存路径。

use crate::error::{Result, ShareError};
use crate::share::ListedFile;
use reqwest::Url;
use std::path::{Component, Path, PathBuf};

/// 对端根地址，接受 `ip:port` 或 `http://ip:port`
pub fn peer_base_url(peer: &str) -> Result<Url> {
    let text = if peer.contains("://") {
        peer.to_string()
    } else {
        format!("http://{peer}")
    };
    let mut url = Url::parse(&text)
        .map_err(|e| ShareError::BadRequest(format!("invalid peer address {peer:?}: {e}")))?;
    url.set_path("/");
    url.set_query(None);
    Ok(url)
}

/// 名称包含 `query` 的文件，不区分大小写；空查询匹配全部
pub fn search_files<'a>(files: &'a [ListedFile], query: &str) -> Vec<&'a ListedFile> {
    let needle = query.trim().to_lowercase();
    files
        .iter()
        .filter(|f| needle.is_empty() || f.name.to_lowercase().contains(&needle))
        .collect()
}

pub fn download_url(base: &Url, file: &ListedFile) -> Result<Url> {
    base.join(&format!("/download/{}", file.id))
        .map_err(|e| ShareError::BadRequest(format!("invalid share id {:?}: {e}", file.id)))
}

/// 本地保存路径 `<root>/<folder>/<name>`
///
/// 列表来自远端，任何会越出 `root` 的部分（`..`、绝对路径、空名称）都被拒绝。
pub fn local_destination(root: &Path, file: &ListedFile) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for part in file.folder.split('/').filter(|p| !p.is_empty()) {
        push_component(&mut path, part)?;
    }
    push_component(&mut path, &file.name)?;
    Ok(path)
}

fn push_component(path: &mut PathBuf, part: &str) -> Result<()> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => {
            path.push(name);
            Ok(())
        }
        _ => Err(ShareError::Forbidden(format!(
            "unsafe path {part:?} in remote listing"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::MediaKind;

    fn listed(name: &str, folder: &str) -> ListedFile {
        ListedFile {
            id: "3f2a".to_string(),
            name: name.to_string(),
            size: "1 B".to_string(),
            size_bytes: 1,
            modified: 0,
            extension: String::new(),
            kind: MediaKind::Other,
            folder: folder.to_string(),
        }
    }

    #[test]
    fn test_peer_base_url() {
        assert_eq!(
            peer_base_url("10.0.0.2:8000").unwrap().as_str(),
            "http://10.0.0.2:8000/"
        );
        assert_eq!(
            peer_base_url("http://10.0.0.2:8000/download/x?token=1")
                .unwrap()
                .as_str(),
            "http://10.0.0.2:8000/"
        );
        assert!(peer_base_url("http://").is_err());
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let files = vec![
            listed("Holiday.MP4", ""),
            listed("notes.txt", ""),
            listed("holiday-2.jpg", "pics"),
        ];
        let hits: Vec<_> = search_files(&files, "HOLIDAY")
            .into_iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(hits, vec!["Holiday.MP4", "holiday-2.jpg"]);
        assert_eq!(search_files(&files, "").len(), 3);
        assert!(search_files(&files, "zip").is_empty());
    }

    #[test]
    fn test_download_url() {
        let base = peer_base_url("10.0.0.2:8000").unwrap();
        assert_eq!(
            download_url(&base, &listed("a.txt", "")).unwrap().as_str(),
            "http://10.0.0.2:8000/download/3f2a"
        );
    }

    #[test]
    fn test_local_destination_stays_inside_root() {
        let root = Path::new("/data/in");
        assert_eq!(
            local_destination(root, &listed("a.txt", "")).unwrap(),
            PathBuf::from("/data/in/a.txt")
        );
        assert_eq!(
            local_destination(root, &listed("a.txt", "music/live")).unwrap(),
            PathBuf::from("/data/in/music/live/a.txt")
        );

        for (name, folder) in [
            ("../evil", ""),
            ("a.txt", "../.."),
            ("a.txt", "ok/../../x"),
            ("/etc/passwd", ""),
            ("..", ""),
            ("", ""),
        ] {
            assert!(
                matches!(
                    local_destination(root, &listed(name, folder)),
                    Err(ShareError::Forbidden(_))
                ),
                "{folder}/{name} must be rejected"
            );
        }
    }
}
