//! LanShare Core Library
//!
//! 局域网点对点文件共享的传输与发现引擎
//!
//! # 模块
//!
//! - **checksum**: 整文件和区间 SHA-256
//! - **resume**: 续传记录持久化
//! - **planner**: 分段下载规划
//! - **discovery**: UDP 广播发现对端
//! - **share**: 共享文件注册表
//! - **transfer**: 文件服务端点和下载客户端
//! - **tracker**: 连接活动跟踪
//! - **logging**: 结构化访问日志
//!
//! # 使用示例
//!
//! ## 共享文件
//!
//! ```ignore
//! use lanshare_core::{ConnectionTracker, FileServer, Settings, ShareRegistry};
//!
//! let settings = Settings::load();
//! let registry = Arc::new(ShareRegistry::new(&settings));
//! registry.add_path(Path::new("/home/me/Videos"))?;
//!
//! let tracker = Arc::new(ConnectionTracker::default());
//! let server = FileServer::new(&settings, registry, tracker);
//! let handle = server.start("0.0.0.0:8000".parse()?).await?;
//! ```
//!
//! ## 下载文件
//!
//! ```ignore
//! use lanshare_core::{DownloadClient, DownloadRequest, NoopCallback};
//!
//! let client = DownloadClient::new(&settings)?;
//! let request = DownloadRequest::new("http://192.168.1.20:8000/download/<id>", "movie.mkv");
//! let report = client
//!     .download(request, Arc::new(NoopCallback), CancellationToken::new())
//!     .await?;
//! ```

pub mod checksum;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod planner;
pub mod resume;
pub mod share;
pub mod tracker;
pub mod transfer;

pub use checksum::Sha256Digest;
pub use config::Settings;
pub use error::{Result, ShareError};

// Discovery re-exports
pub use discovery::{DiscoveryConfig, DiscoveryService, PeerRecord};

// Share re-exports
pub use share::{ShareEntry, ShareRegistry};

// Tracker re-exports
pub use tracker::{ActionKind, ActivityEvent, ConnectionRecord, ConnectionTracker};

// Transfer re-exports
pub use transfer::{
    DownloadCallback, DownloadClient, DownloadHandle, DownloadReport, DownloadRequest,
    FileServer, NoopCallback, ServerHandle, TaskState,
};
