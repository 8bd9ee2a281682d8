//! LanShare Daemon
//!
//! 后台守护进程，负责：
//! - 共享文件的 HTTP 服务
//! - UDP 广播发现
//! - 连接活动跟踪
//! - 通过 Unix Socket 与 CLI 通信

mod ipc;
mod service;

use anyhow::Result;
use lanshare_core::Settings;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（lanshare-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lanshare_core=debug")),
        )
        .try_init();

    tracing::info!("LanShare Daemon starting...");

    let settings = Settings::load();
    let daemon = Arc::new(service::Daemon::start(settings).await?);

    let ipc_handle = tokio::spawn(ipc::run_ipc_server(daemon.clone()));

    tokio::select! {
        res = ipc_handle => {
            tracing::error!("IPC server exited: {:?}", res);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down");
        }
    }

    daemon.shutdown().await;
    let _ = std::fs::remove_file(ipc::socket_path());
    Ok(())
}
