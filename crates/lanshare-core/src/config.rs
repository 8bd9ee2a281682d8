//! 应用配置和持久化
//!
//! 核心库只消费 [`Settings`] 这个键值对象；守护进程负责从
//! `~/.config/lanshare/settings.toml` 加载它。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;

/// 多线程下载线程数上限
pub const MAX_DOWNLOAD_THREADS_LIMIT: usize = 16;

/// 应用设置
///
/// 缺失的字段使用默认值，因此旧的配置文件可以直接加载。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 设备名称（在发现广播中显示）
    pub device_name: String,
    /// HTTP 服务端口
    pub default_port: u16,
    /// 发现协议 UDP 端口
    pub discovery_port: u16,
    /// 广播间隔（秒）
    pub announce_interval_secs: u64,
    /// 对端静默多久后被移除（秒）
    pub peer_ttl_secs: u64,

    /// 单个文件大小上限
    pub max_file_size_mb: u64,
    /// 超过该大小时给出警告
    pub warn_file_size_mb: u64,
    /// 所有共享文件的总大小上限
    pub max_total_share_size_gb: u64,

    pub chunk_size_small: u64,
    pub chunk_size_medium: u64,
    pub chunk_size_large: u64,
    pub chunk_size_xlarge: u64,

    /// 整个下载的超时（秒），0 表示不限制
    pub download_timeout: u64,
    /// 服务端单次响应写出的超时（秒）
    pub upload_timeout: u64,
    /// 建立连接的超时（秒）
    pub connection_timeout: u64,
    /// 单次读取停滞的超时（秒）
    pub read_stall_timeout: u64,

    pub max_concurrent_downloads: usize,
    pub enable_multithreaded_download: bool,
    pub max_download_threads: usize,
    pub min_file_size_for_multithread: u64,
    /// 下载完成每个分段后向服务端核对分段摘要
    pub verify_chunks: bool,

    /// 网络到磁盘拷贝使用的缓冲区大小
    pub tcp_buffer_size: usize,
    pub enable_tcp_nodelay: bool,

    /// 每个来源 IP 每分钟允许的请求数
    pub rate_limit_per_minute: u32,
    /// 设置后所有端点都要求该令牌
    pub access_token: Option<String>,

    /// 启动时加入共享集的文件或目录
    pub share_paths: Vec<PathBuf>,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 续传记录目录，未设置时使用用户数据目录
    pub resume_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: get_default_device_name(),
            default_port: 8000,
            discovery_port: 8001,
            announce_interval_secs: 5,
            peer_ttl_secs: 15,
            max_file_size_mb: 10 * 1024,
            warn_file_size_mb: 1024,
            max_total_share_size_gb: 50,
            chunk_size_small: 8 * KB,
            chunk_size_medium: 64 * KB,
            chunk_size_large: 512 * KB,
            chunk_size_xlarge: MB,
            download_timeout: 0,
            upload_timeout: 300,
            connection_timeout: 30,
            read_stall_timeout: 30,
            max_concurrent_downloads: 5,
            enable_multithreaded_download: true,
            max_download_threads: 4,
            min_file_size_for_multithread: 10 * MB,
            verify_chunks: true,
            tcp_buffer_size: 256 * 1024,
            enable_tcp_nodelay: true,
            rate_limit_per_minute: 60,
            access_token: None,
            share_paths: Vec::new(),
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            resume_dir: None,
        }
    }
}

impl Settings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lanshare");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match toml::from_str::<Settings>(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings.validated();
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// 把越界的数值拉回合法范围
    #[must_use]
    pub fn validated(mut self) -> Self {
        let defaults = Settings::default();
        self.max_download_threads = self
            .max_download_threads
            .clamp(1, MAX_DOWNLOAD_THREADS_LIMIT);
        self.max_concurrent_downloads = self.max_concurrent_downloads.max(1);
        for (value, fallback) in [
            (&mut self.chunk_size_small, defaults.chunk_size_small),
            (&mut self.chunk_size_medium, defaults.chunk_size_medium),
            (&mut self.chunk_size_large, defaults.chunk_size_large),
            (&mut self.chunk_size_xlarge, defaults.chunk_size_xlarge),
        ] {
            if *value == 0 {
                *value = fallback;
            }
        }
        if self.announce_interval_secs == 0 {
            self.announce_interval_secs = defaults.announce_interval_secs;
        }
        if self.peer_ttl_secs < self.announce_interval_secs {
            self.peer_ttl_secs = self.announce_interval_secs * 3;
        }
        self
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * MB
    }

    pub fn warn_file_size_bytes(&self) -> u64 {
        self.warn_file_size_mb * MB
    }

    pub fn max_total_share_size_bytes(&self) -> u64 {
        self.max_total_share_size_gb * GB
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout.max(1))
    }

    pub fn read_stall_timeout(&self) -> Duration {
        Duration::from_secs(self.read_stall_timeout.max(1))
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout.max(1))
    }

    /// 整体下载超时，0 表示不限制
    pub fn download_timeout(&self) -> Option<Duration> {
        (self.download_timeout > 0).then(|| Duration::from_secs(self.download_timeout))
    }

    /// 续传记录目录
    pub fn resume_dir(&self) -> PathBuf {
        self.resume_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("lanshare")
                .join("resume")
        })
    }

    /// 按文件大小检查是否允许共享
    pub fn validate_file_size(&self, size: u64) -> SizeVerdict {
        if size > self.max_file_size_bytes() {
            SizeVerdict::Reject(format!(
                "File exceeds maximum size limit of {} MB",
                self.max_file_size_mb
            ))
        } else if size > self.warn_file_size_bytes() {
            SizeVerdict::Warn(format!(
                "Large file ({}) - transfer may take time",
                format_file_size(size)
            ))
        } else {
            SizeVerdict::Ok
        }
    }
}

/// 文件大小检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeVerdict {
    Ok,
    Warn(String),
    Reject(String),
}

/// 格式化文件大小 (例如 "1.5 GB")
#[allow(clippy::cast_precision_loss)]
pub fn format_file_size(size: u64) -> String {
    if size < KB {
        format!("{size} B")
    } else if size < MB {
        format!("{:.1} KB", size as f64 / KB as f64)
    } else if size < GB {
        format!("{:.1} MB", size as f64 / MB as f64)
    } else {
        format!("{:.2} GB", size as f64 / GB as f64)
    }
}

/// 获取默认设备名称（主机名）
fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "LanShare".to_string())
}
