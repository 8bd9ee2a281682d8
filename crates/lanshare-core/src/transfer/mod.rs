//! 文件传输模块
//!
//! 包含:
//! - 文件服务端点（axum，支持 Range 和 HEAD）
//! - 多线程可续传下载客户端（reqwest）
//! - 访问控制、限速和 Range 解析
//! - 浏览和搜索对端的共享列表

pub mod browse;
pub mod client;
pub mod progress;
pub mod range;
pub mod security;
pub mod server;
pub mod task;

pub use browse::{download_url, local_destination, peer_base_url, search_files};
pub use client::{
    DownloadCallback, DownloadClient, DownloadHandle, DownloadReport, DownloadRequest,
    NoopCallback,
};
pub use progress::{ProgressCounter, ProgressSnapshot, SpeedMeter};
pub use security::{AccessControl, RateLimiter};
pub use server::{AppState, ChecksumResponse, FileServer, ServerHandle};
pub use task::{TaskState, TransferTask};
